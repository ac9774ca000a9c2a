//! Single-layer unidirectional LSTM.
//!
//! Two call forms share the name `lstm`:
//!
//! * packed: `(data, batch_sizes, hx, params, has_biases, num_layers, dropout, train,
//!   bidirectional)` where `data` is `[total_steps, input]` and `batch_sizes` holds the
//!   number of active sequences at each time step;
//! * padded: `(input, hx, params, has_biases, num_layers, dropout, train, bidirectional,
//!   batch_first)` where `input` is `[seq, batch, input]` (or `[batch, seq, input]`).
//!
//! `hx` is `[h0, c0]`, each `[1, batch, hidden]`. `params` is `[w_ih, w_hh]` followed by
//! `[b_ih, b_hh]` when `has_biases` is set. Both forms return `[output, h_n, c_n]`.

use anyhow::{bail, ensure, Context, Result};
use optrack::profiling::kernel_scope;
use optrack::{CallArgs, Tensor, Value};

use crate::linalg::{gemm, transpose};

struct LstmWeights {
    input_size: usize,
    hidden: usize,
    /// `[input, 4 * hidden]`
    w_ih_t: Vec<f32>,
    /// `[hidden, 4 * hidden]`
    w_hh_t: Vec<f32>,
    /// `b_ih + b_hh`
    bias: Vec<f32>,
}

impl LstmWeights {
    fn from_params(params: &[Value], has_biases: bool) -> Result<Self> {
        let expected = if has_biases { 4 } else { 2 };
        ensure!(
            params.len() == expected,
            "lstm: expected {expected} parameter tensors, got {}",
            params.len()
        );
        let tensor = |index: usize| -> Result<&Tensor> {
            params[index]
                .as_tensor()
                .with_context(|| format!("lstm: parameter {index} is not a tensor"))
        };
        let w_ih = tensor(0)?;
        let w_hh = tensor(1)?;
        let (gates, input_size) = match w_ih.shape().dims() {
            &[gates, input] => (gates, input),
            _ => bail!("lstm: w_ih must be 2-d, got shape {}", w_ih.shape()),
        };
        ensure!(gates % 4 == 0, "lstm: w_ih rows ({gates}) must be 4 * hidden");
        let hidden = gates / 4;
        ensure!(
            w_hh.shape().dims() == [gates, hidden],
            "lstm: w_hh must be [{gates}, {hidden}], got shape {}",
            w_hh.shape()
        );

        let mut bias = vec![0.0; gates];
        if has_biases {
            for index in [2, 3] {
                let b = tensor(index)?;
                ensure!(
                    b.len() == gates,
                    "lstm: bias {index} must have {gates} elements, got {}",
                    b.len()
                );
                for (acc, v) in bias.iter_mut().zip(b.to_vec_f32()) {
                    *acc += v;
                }
            }
        }

        Ok(LstmWeights {
            input_size,
            hidden,
            w_ih_t: transpose(&w_ih.to_vec_f32(), gates, input_size),
            w_hh_t: transpose(&w_hh.to_vec_f32(), gates, hidden),
            bias,
        })
    }

    /// Advances the first `rows` sequences by one step; `x` is `[rows, input]`.
    fn step(&self, x: &[f32], rows: usize, h: &mut [f32], c: &mut [f32]) -> Vec<f32> {
        let hidden = self.hidden;
        let gates_width = 4 * hidden;
        let mut gates = gemm(x, &self.w_ih_t, rows, self.input_size, gates_width);
        let recurrent = gemm(&h[..rows * hidden], &self.w_hh_t, rows, hidden, gates_width);

        let mut out = vec![0.0; rows * hidden];
        for row in 0..rows {
            let g = &mut gates[row * gates_width..(row + 1) * gates_width];
            for (j, value) in g.iter_mut().enumerate() {
                *value += recurrent[row * gates_width + j] + self.bias[j];
            }
            for unit in 0..hidden {
                let input_gate = sigmoid(g[unit]);
                let forget_gate = sigmoid(g[hidden + unit]);
                let cell_gate = g[2 * hidden + unit].tanh();
                let output_gate = sigmoid(g[3 * hidden + unit]);
                let idx = row * hidden + unit;
                c[idx] = forget_gate * c[idx] + input_gate * cell_gate;
                h[idx] = output_gate * c[idx].tanh();
                out[idx] = h[idx];
            }
        }
        out
    }

    fn flops_per_row(&self) -> usize {
        2 * 4 * self.hidden * (self.input_size + self.hidden)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn initial_state(hx: &Value, batch: usize, hidden: usize) -> Result<(Vec<f32>, Vec<f32>)> {
    let items = hx.as_list().context("lstm: hx must be a list of [h0, c0]")?;
    let [h0, c0] = items else {
        bail!("lstm: hx must hold exactly two tensors, got {}", items.len());
    };
    let mut state = Vec::with_capacity(2);
    for (label, value) in [("h0", h0), ("c0", c0)] {
        let tensor = value
            .as_tensor()
            .with_context(|| format!("lstm: {label} is not a tensor"))?;
        ensure!(
            tensor.len() == batch * hidden,
            "lstm: {label} must hold {batch} x {hidden} values, got shape {}",
            tensor.shape()
        );
        state.push(tensor.to_vec_f32());
    }
    let c = state.pop().unwrap_or_default();
    let h = state.pop().unwrap_or_default();
    Ok((h, c))
}

fn flag(args: &CallArgs, index: usize, name: &str) -> Result<bool> {
    match args.get(index, name) {
        None => Ok(false),
        Some(value) => value
            .as_bool()
            .with_context(|| format!("lstm: `{name}` must be a bool, got {}", value.type_name())),
    }
}

fn check_single_layer(
    args: &CallArgs,
    num_layers_at: usize,
    bidirectional_at: usize,
) -> Result<()> {
    if let Some(layers) = args.get(num_layers_at, "num_layers").and_then(Value::as_int) {
        ensure!(layers == 1, "lstm: only single-layer networks are supported, got {layers}");
    }
    ensure!(
        !flag(args, bidirectional_at, "bidirectional")?,
        "lstm: bidirectional networks are not supported"
    );
    Ok(())
}

fn batch_sizes(value: &Value) -> Result<Vec<usize>> {
    let raw: Vec<i64> = match value {
        Value::Tensor(tensor) => tensor.to_vec_f32().into_iter().map(|v| v as i64).collect(),
        Value::List(items) => items
            .iter()
            .map(|item| item.as_int().context("lstm: batch sizes must be integers"))
            .collect::<Result<_>>()?,
        other => bail!("lstm: batch sizes must be a tensor or list, got {}", other.type_name()),
    };
    let mut sizes = Vec::with_capacity(raw.len());
    for size in raw {
        ensure!(size > 0, "lstm: batch sizes must be positive, got {size}");
        sizes.push(size as usize);
    }
    ensure!(
        sizes.windows(2).all(|pair| pair[0] >= pair[1]),
        "lstm: batch sizes must be non-increasing"
    );
    Ok(sizes)
}

fn state_output(values: Vec<f32>, batch: usize, hidden: usize) -> Result<Value> {
    Ok(Tensor::from_vec([1, batch, hidden], values)?.into())
}

pub(crate) fn lstm(args: &CallArgs) -> Result<Value> {
    if matches!(args.arg(4), Some(Value::Bool(_))) {
        packed(args)
    } else {
        padded(args)
    }
}

fn packed(args: &CallArgs) -> Result<Value> {
    let data = crate::tensor_arg("lstm", args, 0, "data")?;
    let sizes = batch_sizes(args.arg(1).context("lstm: missing batch sizes")?)?;
    let params = args
        .arg(3)
        .and_then(Value::as_list)
        .context("lstm: params must be a list of tensors")?;
    let weights = LstmWeights::from_params(params, flag(args, 4, "has_biases")?)?;
    check_single_layer(args, 5, 8)?;

    let (steps_total, input_size) = match data.shape().dims() {
        &[total, input] => (total, input),
        _ => bail!("lstm: packed data must be 2-d, got shape {}", data.shape()),
    };
    ensure!(
        input_size == weights.input_size,
        "lstm: data has {input_size} features, weights expect {}",
        weights.input_size
    );
    ensure!(
        sizes.iter().sum::<usize>() == steps_total,
        "lstm: batch sizes sum to {}, data has {steps_total} rows",
        sizes.iter().sum::<usize>()
    );

    let batch = sizes.first().copied().unwrap_or(0);
    let hidden = weights.hidden;
    let hx = args.arg(2).context("lstm: missing hx")?;
    let (mut h, mut c) = initial_state(hx, batch, hidden)?;

    let mut kernel = kernel_scope("lstm_packed");
    kernel.metric("flops", (weights.flops_per_row() * steps_total) as f64);
    let x = data.to_vec_f32();
    let mut output = Vec::with_capacity(steps_total * hidden);
    let mut offset = 0;
    for rows in sizes {
        let step_input = &x[offset * input_size..(offset + rows) * input_size];
        output.extend(weights.step(step_input, rows, &mut h, &mut c));
        offset += rows;
    }
    drop(kernel);

    Ok(Value::List(vec![
        Tensor::from_vec([steps_total, hidden], output)?.into(),
        state_output(h, batch, hidden)?,
        state_output(c, batch, hidden)?,
    ]))
}

fn padded(args: &CallArgs) -> Result<Value> {
    let input = crate::tensor_arg("lstm", args, 0, "input")?;
    let params = args
        .arg(2)
        .and_then(Value::as_list)
        .context("lstm: params must be a list of tensors")?;
    let weights = LstmWeights::from_params(params, flag(args, 3, "has_biases")?)?;
    check_single_layer(args, 4, 7)?;
    let batch_first = flag(args, 8, "batch_first")?;

    let (seq, batch, input_size) = match (input.shape().dims(), batch_first) {
        (&[seq, batch, features], false) => (seq, batch, features),
        (&[batch, seq, features], true) => (seq, batch, features),
        _ => bail!("lstm: input must be 3-d, got shape {}", input.shape()),
    };
    ensure!(
        input_size == weights.input_size,
        "lstm: input has {input_size} features, weights expect {}",
        weights.input_size
    );
    let hidden = weights.hidden;
    let hx = args.arg(1).context("lstm: missing hx")?;
    let (mut h, mut c) = initial_state(hx, batch, hidden)?;

    let x = input.to_vec_f32();
    let time_major = |t: usize| -> Vec<f32> {
        if batch_first {
            (0..batch)
                .flat_map(|b| {
                    let start = (b * seq + t) * input_size;
                    x[start..start + input_size].iter().copied()
                })
                .collect()
        } else {
            x[t * batch * input_size..(t + 1) * batch * input_size].to_vec()
        }
    };

    let mut kernel = kernel_scope("lstm_padded");
    kernel.metric("flops", (weights.flops_per_row() * seq * batch) as f64);
    let mut steps = Vec::with_capacity(seq);
    for t in 0..seq {
        steps.push(weights.step(&time_major(t), batch, &mut h, &mut c));
    }
    drop(kernel);

    let output = if batch_first {
        let mut out = vec![0.0; seq * batch * hidden];
        for (t, step) in steps.iter().enumerate() {
            for b in 0..batch {
                let dst = (b * seq + t) * hidden;
                out[dst..dst + hidden].copy_from_slice(&step[b * hidden..(b + 1) * hidden]);
            }
        }
        Tensor::from_vec([batch, seq, hidden], out)?
    } else {
        Tensor::from_vec([seq, batch, hidden], steps.concat())?
    };

    Ok(Value::List(vec![
        output.into(),
        state_output(h, batch, hidden)?,
        state_output(c, batch, hidden)?,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_params(input: usize, hidden: usize) -> Value {
        Value::List(vec![
            Tensor::zeros([4 * hidden, input]).into(),
            Tensor::zeros([4 * hidden, hidden]).into(),
            Tensor::zeros([4 * hidden]).into(),
            Tensor::zeros([4 * hidden]).into(),
        ])
    }

    fn hx(batch: usize, hidden: usize) -> Value {
        Value::List(vec![
            Tensor::zeros([1, batch, hidden]).into(),
            Tensor::zeros([1, batch, hidden]).into(),
        ])
    }

    #[test]
    fn packed_output_has_one_row_per_step() {
        let args = CallArgs::new()
            .with_arg(Tensor::ones([5, 3]))
            .with_arg(Tensor::from_i32([3], vec![2, 2, 1]).unwrap())
            .with_arg(hx(2, 4))
            .with_arg(zero_params(3, 4))
            .with_arg(true)
            .with_arg(1)
            .with_arg(0.0)
            .with_arg(false)
            .with_arg(false);
        let result = lstm(&args).unwrap();
        let items = result.as_list().unwrap();
        assert_eq!(items[0].as_tensor().unwrap().shape().dims(), &[5, 4]);
        assert_eq!(items[1].as_tensor().unwrap().shape().dims(), &[1, 2, 4]);
    }

    #[test]
    fn zero_weights_keep_the_cell_state_at_zero() {
        let args = CallArgs::new()
            .with_arg(Tensor::ones([2, 1, 3]))
            .with_arg(hx(1, 2))
            .with_arg(zero_params(3, 2))
            .with_arg(true)
            .with_arg(1)
            .with_arg(0.0)
            .with_arg(false)
            .with_arg(false)
            .with_arg(false);
        let result = lstm(&args).unwrap();
        let c_n = result.as_list().unwrap()[2].as_tensor().unwrap().to_vec_f32();
        assert!(c_n.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn batch_sizes_must_cover_every_row() {
        let args = CallArgs::new()
            .with_arg(Tensor::ones([4, 3]))
            .with_arg(Tensor::from_i32([2], vec![2, 1]).unwrap())
            .with_arg(hx(2, 4))
            .with_arg(zero_params(3, 4))
            .with_arg(true);
        assert!(lstm(&args).is_err());
    }
}
