use anyhow::{bail, ensure, Result};
use optrack::profiling::kernel_scope;
use optrack::{CallArgs, Shape, Tensor, Value};

use crate::autograd::{
    any_requires_grad, attach, AddBackward, MulBackward, ReluBackward, SumBackward,
};
use crate::tensor_arg;

enum Operand<'a> {
    Tensor(&'a Tensor),
    Number(f64),
}

impl Operand<'_> {
    fn tensor(&self) -> Option<&Tensor> {
        match self {
            Operand::Tensor(tensor) => Some(tensor),
            Operand::Number(_) => None,
        }
    }
}

fn operand<'a>(op: &str, args: &'a CallArgs, index: usize, name: &str) -> Result<Operand<'a>> {
    match args.get(index, name) {
        Some(Value::Tensor(tensor)) => Ok(Operand::Tensor(tensor)),
        Some(value) => match value.as_f64() {
            Some(number) => Ok(Operand::Number(number)),
            None => bail!("{op}: `{name}` must be a tensor or a number, got {}", value.type_name()),
        },
        None => bail!("{op}: missing argument `{name}`"),
    }
}

/// Expands both operands to the output shape.
///
/// Numbers fill the output shape. A tensor `rhs` whose shape is a suffix of `lhs`'s shape
/// repeats over the leading dimensions.
fn broadcast(op: &str, lhs: &Operand, rhs: &Operand) -> Result<(Shape, Vec<f32>, Vec<f32>)> {
    match (lhs, rhs) {
        (Operand::Tensor(l), Operand::Tensor(r)) => {
            let (ld, rd) = (l.shape().dims(), r.shape().dims());
            ensure!(
                rd.len() <= ld.len() && ld.ends_with(rd),
                "{op}: shapes {} and {} are not broadcastable",
                l.shape(),
                r.shape()
            );
            let rhs = r.to_vec_f32();
            let expanded = rhs.iter().copied().cycle().take(l.len()).collect();
            Ok((l.shape().clone(), l.to_vec_f32(), expanded))
        }
        (Operand::Tensor(t), Operand::Number(n)) => {
            Ok((t.shape().clone(), t.to_vec_f32(), vec![*n as f32; t.len()]))
        }
        (Operand::Number(n), Operand::Tensor(t)) => {
            Ok((t.shape().clone(), vec![*n as f32; t.len()], t.to_vec_f32()))
        }
        (Operand::Number(_), Operand::Number(_)) => {
            bail!("{op}: expected at least one tensor operand")
        }
    }
}

fn alpha(args: &CallArgs) -> Result<Value> {
    match args.kwarg("alpha") {
        None => Ok(Value::Int(1)),
        Some(value @ (Value::Int(_) | Value::Float(_))) => Ok(value.clone()),
        Some(other) => bail!("add: `alpha` must be a number, got {}", other.type_name()),
    }
}

/// `add(input, other, *, alpha=1)`: `input + alpha * other`.
pub(crate) fn add(args: &CallArgs) -> Result<Value> {
    let alpha = alpha(args)?;
    let lhs = operand("add", args, 0, "input")?;
    let rhs = operand("add", args, 1, "other")?;

    if let (Operand::Number(a), Operand::Number(b)) = (&lhs, &rhs) {
        let _kernel = kernel_scope("scalar_add");
        return Ok(match (args.get(0, "input"), args.get(1, "other"), &alpha) {
            (Some(Value::Int(x)), Some(Value::Int(y)), Value::Int(k)) => Value::Int(x + k * y),
            _ => Value::Float(a + alpha.as_f64().unwrap_or(1.0) * b),
        });
    }

    let scale = alpha.as_f64().unwrap_or(1.0) as f32;
    let (shape, l, r) = broadcast("add", &lhs, &rhs)?;
    let values = {
        let _kernel = kernel_scope("elementwise_add");
        l.iter().zip(&r).map(|(a, b)| a + scale * b).collect()
    };
    let output = Tensor::from_vec(shape, values)?;
    let needs_grad = any_requires_grad(lhs.tensor().into_iter().chain(rhs.tensor()));
    Ok(attach(
        output,
        needs_grad,
        AddBackward {
            lhs: lhs.tensor().cloned(),
            rhs: rhs.tensor().cloned(),
            alpha: scale,
        },
    )
    .into())
}

/// `add_(self, other, *, alpha=1)`: accumulates into `self`'s storage and returns it.
pub(crate) fn add_inplace(args: &CallArgs) -> Result<Value> {
    let target = tensor_arg("add_", args, 0, "self")?;
    let rhs = operand("add_", args, 1, "other")?;
    let scale = alpha(args)?.as_f64().unwrap_or(1.0) as f32;
    let (_, _, r) = broadcast("add_", &Operand::Tensor(target), &rhs)?;

    let _kernel = kernel_scope("elementwise_add_");
    target.update_f32(|values| {
        for (value, b) in values.iter_mut().zip(&r) {
            *value += scale * b;
        }
    })?;
    Ok(Value::Tensor(target.clone()))
}

/// `mul(input, other)`; tensor operands must share a shape.
pub(crate) fn mul(args: &CallArgs) -> Result<Value> {
    let lhs = operand("mul", args, 0, "input")?;
    let rhs = operand("mul", args, 1, "other")?;
    if let (Operand::Number(a), Operand::Number(b)) = (&lhs, &rhs) {
        let _kernel = kernel_scope("scalar_mul");
        return Ok(match (args.get(0, "input"), args.get(1, "other")) {
            (Some(Value::Int(a)), Some(Value::Int(b))) => Value::Int(a * b),
            _ => Value::Float(a * b),
        });
    }
    if let (Operand::Tensor(l), Operand::Tensor(r)) = (&lhs, &rhs) {
        ensure!(
            l.shape() == r.shape(),
            "mul: shapes {} and {} differ",
            l.shape(),
            r.shape()
        );
    }

    let (shape, l, r) = broadcast("mul", &lhs, &rhs)?;
    let values = {
        let _kernel = kernel_scope("elementwise_mul");
        l.iter().zip(&r).map(|(a, b)| a * b).collect()
    };
    let output = Tensor::from_vec(shape.clone(), values)?;
    let needs_grad = any_requires_grad(lhs.tensor().into_iter().chain(rhs.tensor()));
    let as_tensor = |operand: &Operand, fill: &[f32]| -> Result<Tensor> {
        match operand {
            Operand::Tensor(tensor) => Ok((*tensor).clone()),
            Operand::Number(_) => Tensor::from_vec(shape.clone(), fill.to_vec()),
        }
    };
    let grad_fn = MulBackward {
        lhs: as_tensor(&lhs, &l)?,
        rhs: as_tensor(&rhs, &r)?,
    };
    Ok(attach(output, needs_grad, grad_fn).into())
}

pub(crate) fn relu(args: &CallArgs) -> Result<Value> {
    let input = tensor_arg("relu", args, 0, "input")?;
    let values = {
        let _kernel = kernel_scope("relu");
        input.to_vec_f32().into_iter().map(|x| x.max(0.0)).collect()
    };
    let output = Tensor::from_vec(input.shape().clone(), values)?;
    let needs_grad = input.requires_grad_flag();
    Ok(attach(
        output,
        needs_grad,
        ReluBackward {
            input: input.clone(),
        },
    )
    .into())
}

/// Sum of all elements as a rank-0 tensor.
pub(crate) fn sum(args: &CallArgs) -> Result<Value> {
    let input = tensor_arg("sum", args, 0, "input")?;
    let total = {
        let _kernel = kernel_scope("reduce_sum");
        input.to_vec_f32().iter().sum::<f32>()
    };
    let needs_grad = input.requires_grad_flag();
    Ok(attach(
        Tensor::scalar(total),
        needs_grad,
        SumBackward {
            input: input.clone(),
        },
    )
    .into())
}
