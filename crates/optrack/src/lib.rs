//! Per-operation tracking and profiling.
//!
//! An [`OperationTracker`] replaces the entries of an [`OpTable`] with hooks while it is
//! tracking. Each intercepted call is measured by an [`OperationProfiler`], recorded as a
//! [`MeasuredOperation`], and then executed for real. The recorded [`Trace`] is what
//! cross-device predictions are built from.

pub mod analysis;
pub mod device;
mod env;
pub mod error;
pub mod ops;
pub mod profiling;
pub mod tracking;
pub mod value;

pub use linkme;

pub use analysis::{ArgValue, Arguments, MeasuredOperation, SpecialOperations, Trace};
pub use device::Device;
pub use error::TrackingError;
pub use ops::{op_fn, CallArgs, OpRef, OpTable, Operation};
pub use profiling::{
    kernel_scope, record_kernel, BackwardMode, KernelRecord, KernelTimer, MeasurementResult,
    OperationProfiler, ProfilerConfig,
};
pub use tracking::{
    CallableTracker, OperationTracker, TargetSet, Tracker, TrackerConfig, TrackingScope,
};
pub use value::{DType, GradFn, Shape, Tensor, Value};
