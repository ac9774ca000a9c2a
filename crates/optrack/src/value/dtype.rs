//! Enumerates the scalar element types carried by host tensors.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between tensors and captured argument descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 32-bit signed integer, primarily for index buffers and batch-size descriptors.
    I32,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::F32)
    }
}
