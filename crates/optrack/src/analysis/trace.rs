use serde::{Deserialize, Serialize};

use super::operation::MeasuredOperation;
use crate::device::Device;

/// Ordered record of the operations measured during one tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    device: Device,
    operations: Vec<MeasuredOperation>,
}

impl Trace {
    pub fn new(device: Device, operations: Vec<MeasuredOperation>) -> Self {
        Trace { device, operations }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Operations in call order.
    pub fn operations(&self) -> &[MeasuredOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MeasuredOperation> {
        self.operations.iter()
    }

    pub fn run_time_ms(&self) -> f64 {
        self.operations.iter().map(MeasuredOperation::run_time_ms).sum()
    }
}

impl<'a> IntoIterator for &'a Trace {
    type Item = &'a MeasuredOperation;
    type IntoIter = std::slice::Iter<'a, MeasuredOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}
