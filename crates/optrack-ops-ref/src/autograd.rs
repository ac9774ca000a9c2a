//! Backward functions for the differentiable reference operations.

use std::sync::Arc;

use anyhow::{ensure, Result};
use optrack::profiling::kernel_scope;
use optrack::{GradFn, Tensor};

use crate::linalg::{gemm, transpose};

/// Sends `grad` to `input`: through its gradient function, or into its gradient slot if leaf.
pub(crate) fn propagate(input: &Tensor, grad: Vec<f32>) -> Result<()> {
    if !input.requires_grad_flag() {
        return Ok(());
    }
    match input.grad_fn() {
        Some(grad_fn) => grad_fn.backward(&Tensor::from_vec(input.shape().clone(), grad)?),
        None => input.accumulate_grad(&grad),
    }
}

/// Whether any of `inputs` needs a gradient, i.e. the output should get a backward function.
pub(crate) fn any_requires_grad<'a>(inputs: impl IntoIterator<Item = &'a Tensor>) -> bool {
    inputs.into_iter().any(Tensor::requires_grad_flag)
}

/// Attaches `grad_fn` when the output takes part in a differentiable computation.
pub(crate) fn attach(output: Tensor, needs_grad: bool, grad_fn: impl GradFn + 'static) -> Tensor {
    if needs_grad {
        output.with_grad_fn(Arc::new(grad_fn))
    } else {
        output
    }
}

fn check_grad(name: &str, grad: &Tensor, expected: usize) -> Result<Vec<f32>> {
    ensure!(
        grad.len() == expected,
        "{name}: gradient has {} elements, expected {expected}",
        grad.len()
    );
    Ok(grad.to_vec_f32())
}

pub(crate) struct AddBackward {
    pub lhs: Option<Tensor>,
    pub rhs: Option<Tensor>,
    pub alpha: f32,
}

impl GradFn for AddBackward {
    fn name(&self) -> &str {
        "AddBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<()> {
        let _kernel = kernel_scope("add_backward");
        let grad = grad_output.to_vec_f32();
        if let Some(lhs) = &self.lhs {
            propagate(lhs, check_grad(self.name(), grad_output, lhs.len())?)?;
        }
        if let Some(rhs) = &self.rhs {
            // rhs may have been broadcast over leading dimensions; fold the gradient back.
            let width = rhs.len();
            ensure!(
                width > 0 && grad.len() % width == 0,
                "{}: cannot reduce gradient of {} elements onto {}",
                self.name(),
                grad.len(),
                rhs.shape()
            );
            let mut folded = vec![0.0; width];
            for (i, g) in grad.iter().enumerate() {
                folded[i % width] += g * self.alpha;
            }
            propagate(rhs, folded)?;
        }
        Ok(())
    }
}

/// Scalar operands are stored as tensors of the output's shape.
pub(crate) struct MulBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for MulBackward {
    fn name(&self) -> &str {
        "MulBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<()> {
        let _kernel = kernel_scope("mul_backward");
        let grad = check_grad(self.name(), grad_output, self.lhs.len())?;
        let lhs = self.lhs.to_vec_f32();
        let rhs = self.rhs.to_vec_f32();
        propagate(&self.lhs, grad.iter().zip(&rhs).map(|(g, r)| g * r).collect())?;
        propagate(&self.rhs, grad.iter().zip(&lhs).map(|(g, l)| g * l).collect())
    }
}

pub(crate) struct ReluBackward {
    pub input: Tensor,
}

impl GradFn for ReluBackward {
    fn name(&self) -> &str {
        "ReluBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<()> {
        let _kernel = kernel_scope("relu_backward");
        let grad = check_grad(self.name(), grad_output, self.input.len())?;
        let masked = grad
            .iter()
            .zip(self.input.to_vec_f32())
            .map(|(g, x)| if x > 0.0 { *g } else { 0.0 })
            .collect();
        propagate(&self.input, masked)
    }
}

pub(crate) struct SumBackward {
    pub input: Tensor,
}

impl GradFn for SumBackward {
    fn name(&self) -> &str {
        "SumBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<()> {
        let _kernel = kernel_scope("sum_backward");
        let seed = grad_output.item()?;
        propagate(&self.input, vec![seed; self.input.len()])
    }
}

pub(crate) struct TransposeBackward {
    pub input: Tensor,
}

impl GradFn for TransposeBackward {
    fn name(&self) -> &str {
        "TransposeBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<()> {
        let dims = grad_output.shape().dims();
        ensure!(dims.len() == 2, "TransposeBackward expects a 2-d gradient");
        let grad = transpose(&grad_output.to_vec_f32(), dims[0], dims[1]);
        propagate(&self.input, grad)
    }
}

/// Gradients of `lhs [m, k] x rhs [k, n]`.
pub(crate) struct MatmulBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for MatmulBackward {
    fn name(&self) -> &str {
        "MatmulBackward"
    }

    fn backward(&self, grad_output: &Tensor) -> Result<()> {
        let (m, k) = (self.lhs.shape().dims()[0], self.lhs.shape().dims()[1]);
        let n = self.rhs.shape().dims()[1];
        let grad = check_grad(self.name(), grad_output, m * n)?;

        let mut kernel = kernel_scope("gemm_backward");
        kernel.metric("flops", (4 * m * k * n) as f64);
        let rhs_t = transpose(&self.rhs.to_vec_f32(), k, n);
        let lhs_t = transpose(&self.lhs.to_vec_f32(), m, k);
        let grad_lhs = gemm(&grad, &rhs_t, m, n, k);
        let grad_rhs = gemm(&lhs_t, &grad, k, m, n);
        drop(kernel);

        propagate(&self.lhs, grad_lhs)?;
        propagate(&self.rhs, grad_rhs)
    }
}
