//! Host tensor passed through hooked operations.
//!
//! Storage and gradient slots are reference counted so that shallow clones share data the
//! way argument passing does in the host runtime. In-place operations mutate the shared
//! storage; [`Tensor::deep_clone`] produces an independent copy.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, ensure, Result};

use super::{DType, Shape, Value};

/// Backward function attached to a tensor produced by a differentiable operation.
///
/// Implementations compute gradients for their inputs and forward them to the inputs'
/// own gradient functions, or accumulate them into leaf tensors.
pub trait GradFn: Send + Sync {
    fn name(&self) -> &str;

    fn backward(&self, grad_output: &Tensor) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
enum Storage {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

#[derive(Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    storage: Arc<RwLock<Storage>>,
    grad: Arc<Mutex<Option<Vec<f32>>>>,
    requires_grad: bool,
    grad_fn: Option<Arc<dyn GradFn>>,
}

impl Tensor {
    fn with_storage(shape: Shape, dtype: DType, storage: Storage) -> Self {
        Tensor {
            shape,
            dtype,
            storage: Arc::new(RwLock::new(storage)),
            grad: Arc::new(Mutex::new(None)),
            requires_grad: false,
            grad_fn: None,
        }
    }

    /// Constructs an `F32` tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {}",
                data.len(),
                shape
            );
        }
        Ok(Self::with_storage(shape, DType::F32, Storage::F32(data)))
    }

    /// Constructs an `I32` tensor, ensuring the payload matches the expected element count.
    pub fn from_i32(shape: impl Into<Shape>, data: Vec<i32>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {}",
                data.len(),
                shape
            );
        }
        Ok(Self::with_storage(shape, DType::I32, Storage::I32(data)))
    }

    /// Returns a rank-0 `F32` tensor holding `value`.
    pub fn scalar(value: f32) -> Self {
        Self::with_storage(Shape::scalar(), DType::F32, Storage::F32(vec![value]))
    }

    /// Returns an `F32` tensor of the requested shape filled with `value`.
    pub fn full(shape: impl Into<Shape>, value: f32) -> Self {
        let shape = shape.into();
        let len = shape.num_elements();
        Self::with_storage(shape, DType::F32, Storage::F32(vec![value; len]))
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    /// One-filled `F32` tensor matching this tensor's shape; the seed gradient for backward.
    pub fn ones_like(&self) -> Self {
        Self::ones(self.shape.clone())
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Copies the payload out as `f32` values, widening integer storage.
    pub fn to_vec_f32(&self) -> Vec<f32> {
        match &*self.read() {
            Storage::F32(values) => values.clone(),
            Storage::I32(values) => values.iter().map(|&v| v as f32).collect(),
        }
    }

    /// Copies the payload out as `i32` values; fails for floating point tensors.
    pub fn to_vec_i32(&self) -> Result<Vec<i32>> {
        match &*self.read() {
            Storage::I32(values) => Ok(values.clone()),
            Storage::F32(_) => bail!("tensor data is not stored as i32"),
        }
    }

    /// Extracts the single element of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        ensure!(
            self.len() == 1,
            "item() requires a one-element tensor, got shape {}",
            self.shape
        );
        Ok(self.to_vec_f32()[0])
    }

    /// Materialises the tensor into nested [`Value`] lists following its shape.
    ///
    /// Rank-0 tensors produce a bare scalar value.
    pub fn to_list(&self) -> Value {
        let flat: Vec<Value> = match &*self.read() {
            Storage::F32(values) => values.iter().map(|&v| Value::Float(f64::from(v))).collect(),
            Storage::I32(values) => values.iter().map(|&v| Value::Int(i64::from(v))).collect(),
        };
        let mut flat = flat.into_iter();
        nest(&mut flat, self.shape.dims())
    }

    /// Applies `f` to the shared `f32` storage; every shallow clone observes the update.
    pub fn update_f32<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut [f32]),
    {
        let mut storage = self
            .storage
            .write()
            .expect("tensor storage lock poisoned");
        match &mut *storage {
            Storage::F32(values) => {
                f(values);
                Ok(())
            }
            Storage::I32(_) => bail!("in-place update requires an f32 tensor"),
        }
    }

    /// Toggles gradient tracking.
    pub fn requires_grad(mut self, flag: bool) -> Self {
        self.requires_grad = flag;
        self
    }

    /// Returns the current gradient tracking flag.
    pub fn requires_grad_flag(&self) -> bool {
        self.requires_grad
    }

    /// Attaches the backward function of the operation that produced this tensor.
    pub fn with_grad_fn(mut self, grad_fn: Arc<dyn GradFn>) -> Self {
        self.requires_grad = true;
        self.grad_fn = Some(grad_fn);
        self
    }

    pub fn grad_fn(&self) -> Option<&Arc<dyn GradFn>> {
        self.grad_fn.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    /// Adds `grad` into the accumulated gradient of a leaf tensor.
    pub fn accumulate_grad(&self, grad: &[f32]) -> Result<()> {
        ensure!(
            grad.len() == self.len(),
            "gradient length ({}) does not match shape {}",
            grad.len(),
            self.shape
        );
        let mut slot = self.grad.lock().expect("tensor gradient lock poisoned");
        match slot.as_mut() {
            Some(existing) => {
                for (acc, g) in existing.iter_mut().zip(grad) {
                    *acc += g;
                }
            }
            None => *slot = Some(grad.to_vec()),
        }
        Ok(())
    }

    /// Returns the accumulated gradient, if any backward pass reached this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        let slot = self.grad.lock().expect("tensor gradient lock poisoned");
        slot.as_ref().map(|values| {
            Self::with_storage(
                self.shape.clone(),
                DType::F32,
                Storage::F32(values.clone()),
            )
        })
    }

    /// Copies the tensor into fresh storage, detached from any autograd history.
    ///
    /// The copy keeps the `requires_grad` flag, so it behaves as a new leaf.
    pub fn deep_clone(&self) -> Tensor {
        let storage = self.read().clone();
        Self::with_storage(self.shape.clone(), self.dtype, storage)
            .requires_grad(self.requires_grad)
    }

    /// Whether both handles refer to the same underlying storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Storage> {
        self.storage.read().expect("tensor storage lock poisoned")
    }
}

fn nest(flat: &mut impl Iterator<Item = Value>, dims: &[usize]) -> Value {
    match dims.split_first() {
        None => flat.next().unwrap_or(Value::None),
        Some((&len, rest)) => Value::List((0..len).map(|_| nest(flat, rest)).collect()),
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        if self.shape != other.shape || self.dtype != other.dtype {
            return false;
        }
        if self.shares_storage(other) {
            return true;
        }
        *self.read() == *other.read()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("requires_grad", &self.requires_grad)
            .field("grad_fn", &self.grad_fn.as_ref().map(|g| g.name().to_string()))
            .finish()
    }
}
