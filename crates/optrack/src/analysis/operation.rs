use serde::{Deserialize, Serialize};

use super::arguments::Arguments;
use crate::device::Device;
use crate::profiling::MeasurementResult;

/// One intercepted call with its measurements. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredOperation {
    name: String,
    arguments: Option<Arguments>,
    forward: Option<MeasurementResult>,
    backward: Option<MeasurementResult>,
    device: Device,
}

impl MeasuredOperation {
    pub fn new(
        name: impl Into<String>,
        arguments: Option<Arguments>,
        forward: Option<MeasurementResult>,
        backward: Option<MeasurementResult>,
        device: Device,
    ) -> Self {
        MeasuredOperation {
            name: name.into(),
            arguments,
            forward,
            backward,
            device,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Captured arguments; present only for special operations.
    pub fn arguments(&self) -> Option<&Arguments> {
        self.arguments.as_ref()
    }

    pub fn forward(&self) -> Option<&MeasurementResult> {
        self.forward.as_ref()
    }

    pub fn backward(&self) -> Option<&MeasurementResult> {
        self.backward.as_ref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Forward plus backward run time; missing passes count as zero.
    pub fn run_time_ms(&self) -> f64 {
        self.forward.as_ref().map_or(0.0, MeasurementResult::run_time_ms)
            + self.backward.as_ref().map_or(0.0, MeasurementResult::run_time_ms)
    }
}
