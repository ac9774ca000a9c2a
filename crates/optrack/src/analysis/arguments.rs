use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ops::CallArgs;
use crate::value::{DType, Value};

/// Captured form of one argument.
///
/// Tensors are reduced to their descriptor; their contents are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ArgValue>),
    Tensor { shape: Vec<usize>, dtype: DType },
}

impl ArgValue {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::None => ArgValue::None,
            Value::Bool(flag) => ArgValue::Bool(*flag),
            Value::Int(v) => ArgValue::Int(*v),
            Value::Float(v) => ArgValue::Float(*v),
            Value::Str(s) => ArgValue::Str(s.clone()),
            Value::List(items) => ArgValue::List(items.iter().map(ArgValue::from_value).collect()),
            Value::Tensor(tensor) => ArgValue::Tensor {
                shape: tensor.shape().to_vec(),
                dtype: tensor.dtype(),
            },
        }
    }

    pub fn as_list(&self) -> Option<&[ArgValue]> {
        match self {
            ArgValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Arguments of a special operation, as needed to rescale its cost on another device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Arguments {
    pub args: Vec<ArgValue>,
    pub kwargs: Vec<(String, ArgValue)>,
    /// Operation-specific metadata that the call signature alone does not expose.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub special: BTreeMap<String, ArgValue>,
}

impl Arguments {
    /// Captures positional and keyword arguments in call order.
    pub fn from_raw_arguments(raw: &CallArgs) -> Self {
        Arguments {
            args: raw.args().iter().map(ArgValue::from_value).collect(),
            kwargs: raw
                .kwargs()
                .iter()
                .map(|(name, value)| (name.clone(), ArgValue::from_value(value)))
                .collect(),
            special: BTreeMap::new(),
        }
    }

    pub fn kwarg(&self, name: &str) -> Option<&ArgValue> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn special(&self, key: &str) -> Option<&ArgValue> {
        self.special.get(key)
    }
}
