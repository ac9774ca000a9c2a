//! Operation abstraction and the dispatch table that hooks are installed into.

mod table;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::value::Value;

pub use table::OpTable;

/// A named callable that can be dispatched through an [`OpTable`].
pub trait Operation: Send + Sync {
    /// Name used for dispatch, special-operation lookup, and trace records.
    fn name(&self) -> &str;

    fn call(&self, args: &CallArgs) -> Result<Value>;
}

/// Shared handle to an operation.
pub type OpRef = Arc<dyn Operation>;

/// Positional and keyword arguments of a single call, in call order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        CallArgs {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Vec::new(),
        }
    }

    /// Appends a positional argument.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument, replacing an earlier value under the same name in place.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.kwargs.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.kwargs.push((name, value)),
        }
        self
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &[(String, Value)] {
        &self.kwargs
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Positional argument at `index`, falling back to the keyword `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.arg(index).or_else(|| self.kwarg(name))
    }

    /// Copy with every tensor argument moved to fresh storage.
    pub fn deep_clone(&self) -> CallArgs {
        CallArgs {
            args: self.args.iter().map(Value::deep_clone).collect(),
            kwargs: self
                .kwargs
                .iter()
                .map(|(key, value)| (key.clone(), value.deep_clone()))
                .collect(),
        }
    }
}

/// Adapts a closure into an [`Operation`].
pub struct FnOperation<F> {
    name: String,
    f: F,
}

impl<F> Operation for FnOperation<F>
where
    F: Fn(&CallArgs) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: &CallArgs) -> Result<Value> {
        (self.f)(args)
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .finish()
    }
}

/// Wraps `f` as a shareable operation called `name`.
pub fn op_fn<F>(name: impl Into<String>, f: F) -> OpRef
where
    F: Fn(&CallArgs) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnOperation {
        name: name.into(),
        f,
    })
}
