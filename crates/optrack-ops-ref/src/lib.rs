//! Reference host operations for exercising operation tracking.
//!
//! The operations compute real results, report their kernels through
//! [`optrack::kernel_scope`], and attach backward functions when an input requires a
//! gradient. `linear` is composed from other table entries so that nested dispatch can be
//! observed.

mod autograd;
mod elementwise;
mod linalg;
mod recurrent;

use std::sync::Arc;

use anyhow::{bail, Result};
use optrack::{op_fn, CallArgs, OpTable, Shape, Tensor, Value};
use rand::Rng;
use tracing::debug;

/// Names registered by [`register_reference_ops`].
pub const REFERENCE_OPS: &[&str] = &[
    "__matmul__",
    "add",
    "add_",
    "linear",
    "lstm",
    "matmul",
    "mul",
    "relu",
    "sum",
    "t",
];

/// Registers every reference operation into `table`, replacing existing entries.
pub fn register_reference_ops(table: &Arc<OpTable>) {
    table.register(op_fn("add", elementwise::add));
    table.register(op_fn("add_", elementwise::add_inplace));
    table.register(op_fn("mul", elementwise::mul));
    table.register(op_fn("relu", elementwise::relu));
    table.register(op_fn("sum", elementwise::sum));
    table.register(op_fn("t", linalg::t));
    table.register(op_fn("matmul", linalg::matmul));
    table.register(op_fn("__matmul__", linalg::matmul));
    let weak = Arc::downgrade(table);
    table.register(op_fn("linear", move |args: &CallArgs| linalg::linear(&weak, args)));
    table.register(op_fn("lstm", recurrent::lstm));
    debug!(count = REFERENCE_OPS.len(), "registered reference operations");
}

/// Fresh table holding only the reference operations.
pub fn reference_table() -> Arc<OpTable> {
    let table = Arc::new(OpTable::new());
    register_reference_ops(&table);
    table
}

/// Tensor of uniform values in `[-1, 1)`.
pub fn random_tensor<R: Rng>(rng: &mut R, shape: impl Into<Shape>) -> Tensor {
    let shape = shape.into();
    let values = (0..shape.num_elements())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    Tensor::from_vec(shape, values).expect("random tensor length matches its shape")
}

/// Random `[w_ih, w_hh, b_ih, b_hh]` parameters for an `lstm` call.
pub fn random_lstm_params<R: Rng>(rng: &mut R, input: usize, hidden: usize) -> Value {
    Value::List(vec![
        random_tensor(rng, [4 * hidden, input]).into(),
        random_tensor(rng, [4 * hidden, hidden]).into(),
        random_tensor(rng, [4 * hidden]).into(),
        random_tensor(rng, [4 * hidden]).into(),
    ])
}

pub(crate) fn tensor_arg<'a>(
    op: &str,
    args: &'a CallArgs,
    index: usize,
    name: &str,
) -> Result<&'a Tensor> {
    match args.get(index, name) {
        Some(Value::Tensor(tensor)) => Ok(tensor),
        Some(other) => bail!("{op}: `{name}` must be a tensor, got {}", other.type_name()),
        None => bail!("{op}: missing argument `{name}`"),
    }
}
