//! Forward/backward measurement of individual operation calls.

mod backward;
mod config;
mod kernels;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::TrackingError;
use crate::ops::{CallArgs, Operation};
use crate::value::{GradFn, Tensor, Value};

use self::backward::BackwardQueue;

pub use backward::CorrelationId;
pub use config::{BackwardMode, ProfilerConfig};
pub use kernels::{
    capture_active, kernel_scope, record_kernel, HostKernelTimer, KernelRecord, KernelScope,
    KernelTimer, Measurement, Pass, TimingRequest,
};

/// Timing and kernel attribution for one pass of one operation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    run_time_ms: f64,
    kernels: Vec<KernelRecord>,
}

impl MeasurementResult {
    pub fn new(run_time_ms: f64, kernels: Vec<KernelRecord>) -> Self {
        MeasurementResult {
            run_time_ms: run_time_ms.max(0.0),
            kernels,
        }
    }

    pub fn run_time_ms(&self) -> f64 {
        self.run_time_ms
    }

    pub fn kernels(&self) -> &[KernelRecord] {
        &self.kernels
    }
}

/// Runs measured work through the timing service following the configured procedure.
#[derive(Clone)]
struct Measurer {
    device: Device,
    config: Arc<ProfilerConfig>,
    timer: Arc<dyn KernelTimer>,
}

impl Measurer {
    /// Dry run, warm-up, averaged timed runs, then one kernel-attribution run.
    ///
    /// Every execution goes through the timer, so a failing timer stops the work from
    /// running at all.
    fn measure(
        &self,
        op: &str,
        pass: Pass,
        correlation: CorrelationId,
        work: &mut dyn FnMut() -> Result<()>,
    ) -> Result<MeasurementResult> {
        let mut request = TimingRequest {
            op,
            pass,
            device: &self.device,
            metrics: &[],
            correlation,
        };

        for _ in 0..=self.config.warm_up {
            self.timer.measure(&request, work)?;
        }

        let runs = self.config.measure_for.max(1);
        let mut total = Duration::ZERO;
        for _ in 0..runs {
            total += self.timer.measure(&request, work)?.elapsed;
        }
        let run_time_ms = total.as_secs_f64() * 1_000.0 / runs as f64;

        if self.config.collects_metrics_for(run_time_ms) {
            request.metrics = &self.config.metrics;
        }
        let kernels = self.timer.measure(&request, work)?.kernels;
        Ok(MeasurementResult::new(run_time_ms, kernels))
    }
}

/// Scope entered around backward work that runs on the queue's worker thread.
pub trait BackwardScope: Send + Sync {
    fn run(
        &self,
        work: &mut dyn FnMut() -> Result<MeasurementResult>,
    ) -> Result<MeasurementResult>;
}

/// Measures operation calls on one device.
pub struct OperationProfiler {
    measurer: Measurer,
    backward_queue: Option<BackwardQueue>,
    backward_scope: Option<Arc<dyn BackwardScope>>,
}

impl OperationProfiler {
    pub fn new(
        device: Device,
        config: ProfilerConfig,
        timer: Arc<dyn KernelTimer>,
    ) -> Result<Self, TrackingError> {
        let backward_queue = match config.backward_mode {
            BackwardMode::Inline => None,
            BackwardMode::Queued => Some(BackwardQueue::spawn()?),
        };
        Ok(OperationProfiler {
            measurer: Measurer {
                device,
                config: Arc::new(config),
                timer,
            },
            backward_queue,
            backward_scope: None,
        })
    }

    /// Runs queued backward measurements inside `scope`.
    pub fn with_backward_scope(mut self, scope: Arc<dyn BackwardScope>) -> Self {
        self.backward_scope = Some(scope);
        self
    }

    pub fn device(&self) -> &Device {
        &self.measurer.device
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.measurer.config
    }

    /// Measures `op` called with `args`, returning `(forward, backward)`.
    ///
    /// Measurement executes the operation for real, several times. Potentially in-place
    /// operations are measured on deep copies of their arguments and have no backward
    /// measurement. Backward is measured on a result computed from deep copies, so it
    /// covers only this operation and leaves the caller's gradients untouched.
    /// `backward` is `None` when the result does not take part in a differentiable
    /// computation, or when a queued backward pass misses the window.
    pub fn measure_operation(
        &self,
        op: &dyn Operation,
        args: &CallArgs,
    ) -> Result<(Option<MeasurementResult>, Option<MeasurementResult>), TrackingError> {
        let name = op.name();
        self.measure_passes(op, args)
            .map_err(|source| TrackingError::Measurement {
                op: name.to_string(),
                source,
            })
    }

    fn measure_passes(
        &self,
        op: &dyn Operation,
        args: &CallArgs,
    ) -> Result<(Option<MeasurementResult>, Option<MeasurementResult>)> {
        let name = op.name();
        let inplace = is_potentially_inplace(name);
        let profiling_args = if inplace {
            args.deep_clone()
        } else {
            args.clone()
        };
        let correlation = CorrelationId::next();

        let forward = self
            .measurer
            .measure(name, Pass::Forward, correlation, &mut || {
                op.call(&profiling_args).map(drop)
            })?;
        if inplace {
            return Ok((Some(forward), None));
        }

        // Detached from the caller's graph: gradients stop at the copies.
        let retval = op.call(&args.deep_clone())?;
        let Some((output, grad_fn)) = backward_target(&retval) else {
            return Ok((Some(forward), None));
        };
        let grad = output.ones_like();

        let backward = match &self.backward_queue {
            None => Some(
                self.measurer
                    .measure(name, Pass::Backward, correlation, &mut || {
                        grad_fn.backward(&grad)
                    })?,
            ),
            Some(queue) => {
                let measurer = self.measurer.clone();
                let scope = self.backward_scope.clone();
                let op_name = name.to_string();
                queue.submit(
                    correlation,
                    Box::new(move || {
                        let mut work = || {
                            measurer.measure(&op_name, Pass::Backward, correlation, &mut || {
                                grad_fn.backward(&grad)
                            })
                        };
                        match scope {
                            Some(scope) => scope.run(&mut work),
                            None => work(),
                        }
                    }),
                )?;
                let window = self.measurer.config.backward_window();
                match queue.wait(correlation, window) {
                    Some(result) => Some(result?),
                    None => {
                        warn!(
                            op = name,
                            %correlation,
                            window_ms = window.as_millis() as u64,
                            "backward measurement missed its window"
                        );
                        None
                    }
                }
            }
        };

        debug!(
            op = name,
            %correlation,
            forward_ms = forward.run_time_ms(),
            backward_ms = ?backward.as_ref().map(MeasurementResult::run_time_ms),
            "measured operation"
        );
        Ok((Some(forward), backward))
    }
}

/// Names following the trailing-underscore convention, plus in-place dunder operators.
pub fn is_potentially_inplace(name: &str) -> bool {
    const INPLACE_OPERATORS: &[&str] = &[
        "__iadd__",
        "__isub__",
        "__imul__",
        "__idiv__",
        "__itruediv__",
        "__ifloordiv__",
        "__imod__",
        "__ipow__",
        "__imatmul__",
        "__iand__",
        "__ior__",
        "__ixor__",
        "__ilshift__",
        "__irshift__",
    ];
    if INPLACE_OPERATORS.contains(&name) {
        return true;
    }
    name.len() > 1 && name.ends_with('_') && !name.ends_with("__")
}

/// The tensor whose backward pass should be measured, if the result is differentiable.
///
/// A list result counts when its first element is a differentiable tensor.
fn backward_target(retval: &Value) -> Option<(Tensor, Arc<dyn GradFn>)> {
    let tensor = match retval {
        Value::Tensor(tensor) => tensor,
        Value::List(items) => items.first()?.as_tensor()?,
        _ => return None,
    };
    if !tensor.requires_grad_flag() {
        return None;
    }
    let grad_fn = Arc::clone(tensor.grad_fn()?);
    Some((tensor.clone(), grad_fn))
}

#[cfg(test)]
mod tests {
    use super::is_potentially_inplace;

    #[test]
    fn inplace_detection_follows_naming_convention() {
        assert!(is_potentially_inplace("add_"));
        assert!(is_potentially_inplace("relu_"));
        assert!(is_potentially_inplace("__iadd__"));
        assert!(!is_potentially_inplace("add"));
        assert!(!is_potentially_inplace("__add__"));
        assert!(!is_potentially_inplace("_"));
    }
}
