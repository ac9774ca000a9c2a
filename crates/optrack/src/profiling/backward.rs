//! Queue that measures backward passes off the calling thread.
//!
//! Every measured invocation carries a [`CorrelationId`]. Completions are posted back under
//! that id, and a waiter only ever consumes its own id, so overlapping in-flight backward
//! work cannot be attributed to the wrong forward call.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::MeasurementResult;

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Token pairing a forward invocation with the backward work it scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn next() -> Self {
        CorrelationId(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type BackwardWork = Box<dyn FnOnce() -> Result<MeasurementResult> + Send>;

struct BackwardJob {
    id: CorrelationId,
    work: BackwardWork,
}

#[derive(Default)]
struct CompletionState {
    finished: HashMap<CorrelationId, Result<MeasurementResult>>,
    abandoned: HashSet<CorrelationId>,
}

#[derive(Default)]
struct Completions {
    state: Mutex<CompletionState>,
    ready: Condvar,
}

impl Completions {
    fn post(&self, id: CorrelationId, result: Result<MeasurementResult>) {
        let mut state = self.state.lock().expect("backward completion lock poisoned");
        if state.abandoned.remove(&id) {
            debug!(correlation = %id, "discarding late backward completion");
            return;
        }
        state.finished.insert(id, result);
        self.ready.notify_all();
    }
}

pub(crate) struct BackwardQueue {
    sender: Mutex<Option<Sender<BackwardJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    completions: Arc<Completions>,
}

impl BackwardQueue {
    pub(crate) fn spawn() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<BackwardJob>();
        let completions = Arc::new(Completions::default());
        let worker_completions = Arc::clone(&completions);
        let worker = thread::Builder::new()
            .name("optrack-backward".to_string())
            .spawn(move || {
                for job in receiver {
                    trace!(correlation = %job.id, "running queued backward measurement");
                    let result = (job.work)();
                    worker_completions.post(job.id, result);
                }
            })?;
        Ok(BackwardQueue {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            completions,
        })
    }

    pub(crate) fn submit(&self, id: CorrelationId, work: BackwardWork) -> Result<()> {
        let sender = self.sender.lock().expect("backward queue lock poisoned");
        let sender = sender
            .as_ref()
            .ok_or_else(|| anyhow!("backward queue is shut down"))?;
        sender
            .send(BackwardJob { id, work })
            .map_err(|_| anyhow!("backward queue worker has exited"))
    }

    /// Blocks until the completion for `id` arrives or `window` elapses.
    ///
    /// On timeout the id is abandoned and its completion is discarded when it arrives.
    pub(crate) fn wait(
        &self,
        id: CorrelationId,
        window: Duration,
    ) -> Option<Result<MeasurementResult>> {
        let deadline = Instant::now() + window;
        let mut state = self
            .completions
            .state
            .lock()
            .expect("backward completion lock poisoned");
        loop {
            if let Some(result) = state.finished.remove(&id) {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                state.abandoned.insert(id);
                return None;
            }
            let (next, _) = self
                .completions
                .ready
                .wait_timeout(state, deadline - now)
                .expect("backward completion lock poisoned");
            state = next;
        }
    }
}

impl Drop for BackwardQueue {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn result(ms: f64) -> MeasurementResult {
        MeasurementResult::new(ms, Vec::new())
    }

    #[test]
    fn completions_are_matched_by_correlation_id() {
        let queue = BackwardQueue::spawn().expect("spawn queue");
        let (release_tx, release_rx) = channel::<()>();
        let first = CorrelationId::next();
        let second = CorrelationId::next();

        queue
            .submit(
                first,
                Box::new(move || {
                    release_rx.recv().ok();
                    Ok(result(1.0))
                }),
            )
            .unwrap();
        queue.submit(second, Box::new(|| Ok(result(2.0)))).unwrap();

        release_tx.send(()).unwrap();
        let second_result = queue.wait(second, Duration::from_secs(5)).unwrap().unwrap();
        let first_result = queue.wait(first, Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(second_result.run_time_ms(), 2.0);
        assert_eq!(first_result.run_time_ms(), 1.0);
    }

    #[test]
    fn timed_out_waiters_discard_late_completions() {
        let queue = BackwardQueue::spawn().expect("spawn queue");
        let (release_tx, release_rx) = channel::<()>();
        let slow = CorrelationId::next();
        queue
            .submit(
                slow,
                Box::new(move || {
                    release_rx.recv().ok();
                    Ok(result(3.0))
                }),
            )
            .unwrap();

        assert!(queue.wait(slow, Duration::from_millis(10)).is_none());
        release_tx.send(()).unwrap();

        let marker = CorrelationId::next();
        queue.submit(marker, Box::new(|| Ok(result(0.0)))).unwrap();
        assert!(queue.wait(marker, Duration::from_secs(5)).is_some());

        let state = queue.completions.state.lock().unwrap();
        assert!(state.finished.is_empty());
        assert!(state.abandoned.is_empty());
    }
}
