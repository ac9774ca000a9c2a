//! Tracker lifecycle, hook installation, and the operation tracker built on top of them.

mod base;
mod callable;
mod operation;

pub use base::{Tracker, TrackingScope, TrackingState};
pub use callable::{CallableTracker, HookFactory, TargetSet};
pub use operation::{OperationHook, OperationHookFactory, OperationTracker, TrackerConfig};
