//! Kernel attribution and the timing service seam.
//!
//! Operation implementations report the kernels they launch through [`kernel_scope`] or
//! [`record_kernel`]. Reports land in the innermost capture frame opened on the current
//! thread by a [`KernelTimer`]; with no frame open they are dropped.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::backward::CorrelationId;
use crate::device::Device;

/// One low-level execution unit attributed to a measured pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRecord {
    name: String,
    run_time_ns: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metrics: BTreeMap<String, f64>,
}

impl KernelRecord {
    pub fn new(name: impl Into<String>, run_time: Duration) -> Self {
        KernelRecord {
            name: name.into(),
            run_time_ns: duration_ns(run_time),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_time_ns(&self) -> u64 {
        self.run_time_ns
    }

    pub fn run_time_ms(&self) -> f64 {
        self.run_time_ns as f64 / 1_000_000.0
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Keeps only the metrics named in `requested`.
    pub(crate) fn retain_metrics(&mut self, requested: &[String]) {
        self.metrics.retain(|name, _| requested.contains(name));
    }
}

fn duration_ns(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Which half of an operation a measurement covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Forward,
    Backward,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Forward => f.write_str("forward"),
            Pass::Backward => f.write_str("backward"),
        }
    }
}

/// Context handed to the timing service for one measured execution.
#[derive(Debug, Clone, Copy)]
pub struct TimingRequest<'a> {
    pub op: &'a str,
    pub pass: Pass,
    pub device: &'a Device,
    /// Metrics to collect per kernel; empty means timing only.
    pub metrics: &'a [String],
    pub correlation: CorrelationId,
}

/// Raw output of a timing service for one execution of the measured work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub elapsed: Duration,
    pub kernels: Vec<KernelRecord>,
}

/// Device-level execution accounting.
///
/// `measure` must run `work` exactly once inside its measurement scope and return the
/// elapsed time together with the kernels attributed to that scope, in launch order.
pub trait KernelTimer: Send + Sync {
    fn measure(
        &self,
        request: &TimingRequest<'_>,
        work: &mut dyn FnMut() -> Result<()>,
    ) -> Result<Measurement>;
}

/// Wall-clock timer for host execution; attributes kernels reported on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostKernelTimer;

impl KernelTimer for HostKernelTimer {
    fn measure(
        &self,
        request: &TimingRequest<'_>,
        work: &mut dyn FnMut() -> Result<()>,
    ) -> Result<Measurement> {
        let capture = CaptureGuard::open();
        let start = Instant::now();
        let outcome = work();
        let elapsed = start.elapsed();
        let mut kernels = capture.close();
        outcome?;
        for kernel in &mut kernels {
            kernel.retain_metrics(request.metrics);
        }
        Ok(Measurement { elapsed, kernels })
    }
}

thread_local! {
    static CAPTURE_STACK: RefCell<Vec<Vec<KernelRecord>>> = const { RefCell::new(Vec::new()) };
}

/// Capture frame that stays balanced on every exit path.
struct CaptureGuard {
    depth: usize,
    closed: bool,
}

impl CaptureGuard {
    fn open() -> Self {
        let depth = CAPTURE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Vec::new());
            stack.len()
        });
        CaptureGuard {
            depth,
            closed: false,
        }
    }

    fn close(mut self) -> Vec<KernelRecord> {
        self.closed = true;
        self.pop()
    }

    fn pop(&self) -> Vec<KernelRecord> {
        CAPTURE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "kernel capture stack corrupted");
            stack.pop().unwrap_or_default()
        })
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.pop();
        }
    }
}

/// Whether a capture frame is open on this thread.
pub fn capture_active() -> bool {
    CAPTURE_STACK.with(|stack| !stack.borrow().is_empty())
}

/// Attributes an already-timed kernel to the innermost capture frame.
pub fn record_kernel(record: KernelRecord) {
    CAPTURE_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            frame.push(record);
        }
    });
}

/// Times a kernel for as long as the returned guard lives.
pub fn kernel_scope(name: &'static str) -> KernelScope {
    KernelScope {
        name,
        start: Instant::now(),
        metrics: BTreeMap::new(),
    }
}

pub struct KernelScope {
    name: &'static str,
    start: Instant,
    metrics: BTreeMap<String, f64>,
}

impl KernelScope {
    /// Attaches a metric value reported by the kernel itself.
    pub fn metric(&mut self, name: &str, value: f64) {
        self.metrics.insert(name.to_string(), value);
    }
}

impl Drop for KernelScope {
    fn drop(&mut self) {
        if !capture_active() {
            return;
        }
        let mut record = KernelRecord::new(self.name, self.start.elapsed());
        record.metrics = std::mem::take(&mut self.metrics);
        record_kernel(record);
    }
}
