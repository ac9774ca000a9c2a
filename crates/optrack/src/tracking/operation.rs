//! Records every intercepted operation call together with its forward/backward timing.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::base::Tracker;
use super::callable::{CallableTracker, HookFactory, TargetSet};
use crate::analysis::special::apply_fixups;
use crate::analysis::{Arguments, MeasuredOperation, SpecialOperations, Trace};
use crate::device::Device;
use crate::error::TrackingError;
use crate::ops::{CallArgs, OpRef, OpTable, Operation};
use crate::profiling::{
    BackwardScope, HostKernelTimer, KernelTimer, MeasurementResult, OperationProfiler,
    ProfilerConfig,
};
use crate::value::Value;

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Trackers whose hook is currently running on this thread.
    static ACTIVE_HOOKS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks a tracker's hook as running on the current thread until dropped.
struct HookGuard {
    tracker: u64,
}

impl HookGuard {
    /// `None` when the tracker's hook is already running further up this thread's stack.
    fn enter(tracker: u64) -> Option<HookGuard> {
        ACTIVE_HOOKS.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&tracker) {
                return None;
            }
            active.push(tracker);
            Some(HookGuard { tracker })
        })
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        ACTIVE_HOOKS.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|id| *id == self.tracker) {
                active.remove(pos);
            }
        });
    }
}

/// Holds a tracker's gate while its queued backward work runs on the worker thread.
struct TrackerGate {
    tracker: u64,
}

impl BackwardScope for TrackerGate {
    fn run(
        &self,
        work: &mut dyn FnMut() -> Result<MeasurementResult>,
    ) -> Result<MeasurementResult> {
        let _guard = HookGuard::enter(self.tracker);
        work()
    }
}

/// Settings for an [`OperationTracker`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub profiler: ProfilerConfig,
    pub special_operations: SpecialOperations,
    /// Operations to hook; every registered operation when unset.
    pub targets: Option<Vec<String>>,
}

impl TrackerConfig {
    /// Defaults with the profiler section read from `OPTRACK_*` variables.
    pub fn from_env() -> Result<Self> {
        Ok(TrackerConfig {
            profiler: ProfilerConfig::from_env()?,
            ..TrackerConfig::default()
        })
    }

    pub fn with_targets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_special_operations(mut self, special: SpecialOperations) -> Self {
        self.special_operations = special;
        self
    }
}

/// State shared between a tracker and the hooks it installs.
struct TrackerShared {
    id: u64,
    device: Device,
    special: SpecialOperations,
    profiler: OperationProfiler,
    operations: Mutex<Vec<MeasuredOperation>>,
}

impl TrackerShared {
    fn capture_arguments(
        &self,
        op: &str,
        raw: &CallArgs,
    ) -> Result<Option<Arguments>, TrackingError> {
        if !self.special.contains(op) {
            return Ok(None);
        }
        let mut arguments = Arguments::from_raw_arguments(raw);
        apply_fixups(op, raw, &mut arguments)?;
        Ok(Some(arguments))
    }

    fn record(&self, operation: MeasuredOperation) {
        self.operations
            .lock()
            .expect("tracked operations poisoned")
            .push(operation);
    }

    fn snapshot(&self) -> Vec<MeasuredOperation> {
        self.operations
            .lock()
            .expect("tracked operations poisoned")
            .clone()
    }
}

/// Installed in place of an original operation while an [`OperationTracker`] is active.
pub struct OperationHook {
    shared: Arc<TrackerShared>,
    original: OpRef,
}

impl Operation for OperationHook {
    fn name(&self) -> &str {
        self.original.name()
    }

    fn call(&self, args: &CallArgs) -> Result<Value> {
        // Operations reached while this tracker is already measuring pass straight through.
        let Some(_guard) = HookGuard::enter(self.shared.id) else {
            return self.original.call(args);
        };
        let name = self.original.name();
        trace!(op = name, tracker = self.shared.id, "intercepted operation");

        let arguments = self.shared.capture_arguments(name, args)?;
        let (forward, backward) = self
            .shared
            .profiler
            .measure_operation(self.original.as_ref(), args)?;
        if let Some(forward) = &forward {
            debug!(
                op = name,
                kernels = ?forward.kernels().iter().map(|k| k.name()).collect::<Vec<_>>(),
                "recorded operation"
            );
        }
        self.shared.record(MeasuredOperation::new(
            name,
            arguments,
            forward,
            backward,
            self.shared.device.clone(),
        ));

        self.original.call(args)
    }
}

/// Creates [`OperationHook`]s bound to one tracker.
pub struct OperationHookFactory {
    shared: Arc<TrackerShared>,
}

impl HookFactory for OperationHookFactory {
    fn make_hook(&self, original: OpRef) -> OpRef {
        Arc::new(OperationHook {
            shared: Arc::clone(&self.shared),
            original,
        })
    }
}

/// Tracks operation calls and builds a [`Trace`] of their measurements.
///
/// Calls made through the dispatch table while tracking are measured, recorded, and then
/// executed for real, so callers see the same results as without tracking. Operations
/// reached from inside a measured operation are not recorded separately.
pub struct OperationTracker {
    shared: Arc<TrackerShared>,
    hooks: CallableTracker<OperationHookFactory>,
}

impl OperationTracker {
    /// Tracker timed on the host clock.
    pub fn new(
        table: Arc<OpTable>,
        device: Device,
        config: TrackerConfig,
    ) -> Result<Self, TrackingError> {
        Self::with_timer(table, device, config, Arc::new(HostKernelTimer))
    }

    pub fn with_timer(
        table: Arc<OpTable>,
        device: Device,
        config: TrackerConfig,
        timer: Arc<dyn KernelTimer>,
    ) -> Result<Self, TrackingError> {
        let TrackerConfig {
            profiler,
            special_operations,
            targets,
        } = config;
        let id = NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed);
        let profiler = OperationProfiler::new(device.clone(), profiler, timer)?
            .with_backward_scope(Arc::new(TrackerGate { tracker: id }));
        let shared = Arc::new(TrackerShared {
            id,
            device,
            special: special_operations,
            profiler,
            operations: Mutex::new(Vec::new()),
        });
        let targets = targets.map_or(TargetSet::All, TargetSet::Named);
        let hooks = CallableTracker::new(
            table,
            targets,
            OperationHookFactory {
                shared: Arc::clone(&shared),
            },
        );
        Ok(OperationTracker { shared, hooks })
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    /// Snapshot of the operations recorded so far, in call order.
    pub fn get_tracked_trace(&self) -> Trace {
        Trace::new(self.shared.device.clone(), self.shared.snapshot())
    }
}

impl Tracker for OperationTracker {
    fn start_tracking(&mut self) -> Result<(), TrackingError> {
        self.hooks.start_tracking()
    }

    fn stop_tracking(&mut self) -> Result<(), TrackingError> {
        self.hooks.stop_tracking()
    }

    fn is_tracking(&self) -> bool {
        self.hooks.is_tracking()
    }
}
