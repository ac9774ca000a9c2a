//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stores the logical dimensions of a tensor. A rank-0 shape describes a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new<D: AsRef<[usize]>>(dims: D) -> Self {
        Shape {
            dims: SmallVec::from_slice(dims.as_ref()),
        }
    }

    /// Shape of a rank-0 tensor.
    pub fn scalar() -> Self {
        Shape::default()
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.dims.to_vec()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}
