//! Special operations and the argument fixups some of them need.
//!
//! Special operations are the ones whose cost is rescaled across devices from their
//! arguments, so only they get an [`Arguments`] capture. Fixups are registered per
//! operation name in [`ARGUMENT_FIXUPS`] and may be contributed from any crate.

use std::collections::BTreeSet;

use linkme::distributed_slice;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::arguments::{ArgValue, Arguments};
use crate::error::TrackingError;
use crate::ops::CallArgs;
use crate::value::Value;

const DEFAULT_SPECIAL_NAMES: &[&str] = &["__matmul__", "bmm", "conv2d", "linear", "lstm", "matmul"];

static DEFAULT_SPECIAL_OPERATIONS: Lazy<SpecialOperations> =
    Lazy::new(|| SpecialOperations::from_names(DEFAULT_SPECIAL_NAMES.iter().copied()));

/// Read-only set of operation names whose arguments are captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecialOperations(BTreeSet<String>);

impl SpecialOperations {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SpecialOperations(names.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        SpecialOperations(BTreeSet::new())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for SpecialOperations {
    fn default() -> Self {
        DEFAULT_SPECIAL_OPERATIONS.clone()
    }
}

/// Result of running a fixup against one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupOutcome {
    Applied,
    /// The call does not have the shape this fixup targets.
    Skipped,
}

/// Follow-up correction for the captured arguments of one operation.
pub struct ArgumentFixup {
    pub op: &'static str,
    /// Positional arity the handler relies on; shorter calls fail before `apply` runs.
    pub min_positional: usize,
    pub apply: fn(&CallArgs, &mut Arguments) -> Result<FixupOutcome, TrackingError>,
}

#[distributed_slice]
pub static ARGUMENT_FIXUPS: [ArgumentFixup] = [..];

pub fn fixups_for(op: &str) -> impl Iterator<Item = &'static ArgumentFixup> + '_ {
    ARGUMENT_FIXUPS.iter().filter(move |fixup| fixup.op == op)
}

/// Runs every fixup registered for `op`, failing on the first violated assumption.
pub(crate) fn apply_fixups(
    op: &str,
    raw: &CallArgs,
    arguments: &mut Arguments,
) -> Result<(), TrackingError> {
    for fixup in fixups_for(op) {
        if raw.args().len() < fixup.min_positional {
            return Err(TrackingError::capture(
                op,
                format!(
                    "expected at least {} positional arguments, got {}",
                    fixup.min_positional,
                    raw.args().len()
                ),
            ));
        }
        if (fixup.apply)(raw, arguments)? == FixupOutcome::Skipped {
            trace!(op, "argument fixup does not apply to this call");
        }
    }
    Ok(())
}

pub const BATCH_SIZES_KEY: &str = "batch_sizes";

#[distributed_slice(ARGUMENT_FIXUPS)]
static LSTM_BATCH_SIZES: ArgumentFixup = ArgumentFixup {
    op: "lstm",
    min_positional: 5,
    apply: lstm_batch_sizes,
};

/// Packed-sequence `lstm` calls carry a bool in position 4 and a batch-size tensor in
/// position 1; the tensor is captured as a shape only, so its values are stashed.
fn lstm_batch_sizes(
    raw: &CallArgs,
    arguments: &mut Arguments,
) -> Result<FixupOutcome, TrackingError> {
    if !matches!(raw.arg(4), Some(Value::Bool(_))) {
        return Ok(FixupOutcome::Skipped);
    }
    let batch_sizes = match raw.arg(1) {
        Some(Value::Tensor(tensor)) if tensor.shape().rank() == 1 => tensor.to_list(),
        Some(Value::Tensor(tensor)) => {
            return Err(TrackingError::capture(
                "lstm",
                format!(
                    "batch sizes must be a 1-d tensor, got shape {}",
                    tensor.shape()
                ),
            ))
        }
        Some(Value::List(items)) => Value::List(items.clone()),
        Some(other) => {
            return Err(TrackingError::capture(
                "lstm",
                format!(
                    "batch sizes must be a tensor or list, got {}",
                    other.type_name()
                ),
            ))
        }
        None => return Err(TrackingError::capture("lstm", "missing batch sizes")),
    };
    arguments
        .special
        .insert(BATCH_SIZES_KEY.to_string(), ArgValue::from_value(&batch_sizes));
    Ok(FixupOutcome::Applied)
}
