use std::sync::Weak;

use anyhow::{ensure, Context, Result};
use optrack::profiling::kernel_scope;
use optrack::{CallArgs, OpTable, Tensor, Value};

use crate::autograd::{any_requires_grad, attach, MatmulBackward, TransposeBackward};
use crate::tensor_arg;

/// Row-major `a [m, inner] x b [inner, n]`.
pub(crate) fn gemm(a: &[f32], b: &[f32], m: usize, inner: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0; m * n];
    for row in 0..m {
        for k in 0..inner {
            let a_rk = a[row * inner + k];
            if a_rk == 0.0 {
                continue;
            }
            let out_row = &mut out[row * n..(row + 1) * n];
            for (o, b_kc) in out_row.iter_mut().zip(&b[k * n..(k + 1) * n]) {
                *o += a_rk * b_kc;
            }
        }
    }
    out
}

/// Row-major `[rows, cols]` to `[cols, rows]`.
pub(crate) fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

fn matrix_dims(op: &str, tensor: &Tensor) -> Result<(usize, usize)> {
    match tensor.shape().dims() {
        &[rows, cols] => Ok((rows, cols)),
        _ => anyhow::bail!("{op}: expected a 2-d tensor, got shape {}", tensor.shape()),
    }
}

/// `t(input)`: transpose of a 2-d tensor.
pub(crate) fn t(args: &CallArgs) -> Result<Value> {
    let input = tensor_arg("t", args, 0, "input")?;
    let (rows, cols) = matrix_dims("t", input)?;
    let values = {
        let _kernel = kernel_scope("transpose");
        transpose(&input.to_vec_f32(), rows, cols)
    };
    let output = Tensor::from_vec([cols, rows], values)?;
    Ok(attach(
        output,
        input.requires_grad_flag(),
        TransposeBackward {
            input: input.clone(),
        },
    )
    .into())
}

/// `matmul(input, other)` for 2-d operands.
pub(crate) fn matmul(args: &CallArgs) -> Result<Value> {
    let lhs = tensor_arg("matmul", args, 0, "input")?;
    let rhs = tensor_arg("matmul", args, 1, "other")?;
    let (m, k) = matrix_dims("matmul", lhs)?;
    let (k2, n) = matrix_dims("matmul", rhs)?;
    ensure!(
        k == k2,
        "matmul: inner dimensions differ ({} vs {})",
        lhs.shape(),
        rhs.shape()
    );

    let values = {
        let mut kernel = kernel_scope("gemm");
        kernel.metric("flops", (2 * m * k * n) as f64);
        kernel.metric("bytes", (4 * (m * k + k * n + m * n)) as f64);
        gemm(&lhs.to_vec_f32(), &rhs.to_vec_f32(), m, k, n)
    };
    let output = Tensor::from_vec([m, n], values)?;
    Ok(attach(
        output,
        any_requires_grad([lhs, rhs]),
        MatmulBackward {
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        },
    )
    .into())
}

/// `linear(input, weight, bias=None)`: `input @ weight.T + bias`.
///
/// Composed from `t`, `matmul` and `add` dispatched through `table`, so the nested calls
/// pass through whatever is installed there.
pub(crate) fn linear(table: &Weak<OpTable>, args: &CallArgs) -> Result<Value> {
    let table = table
        .upgrade()
        .context("linear: dispatch table no longer exists")?;
    let input = tensor_arg("linear", args, 0, "input")?;
    let weight = tensor_arg("linear", args, 1, "weight")?;

    let weight_t = table.call("t", &CallArgs::new().with_arg(weight.clone()))?;
    let output = table.call(
        "matmul",
        &CallArgs::new().with_arg(input.clone()).with_arg(weight_t),
    )?;
    match args.get(2, "bias") {
        None | Some(Value::None) => Ok(output),
        Some(bias) => table.call("add", &CallArgs::new().with_arg(output).with_arg(bias.clone())),
    }
}
