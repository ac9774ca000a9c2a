//! Scoped start/stop lifecycle shared by every tracker.

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::error::TrackingError;

/// Tracking flag embedded by each tracker implementation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackingState {
    is_tracking: bool,
}

impl TrackingState {
    pub fn is_tracking(&self) -> bool {
        self.is_tracking
    }

    /// Marks tracking as started; returns `false` if it already was.
    pub fn start(&mut self) -> bool {
        !std::mem::replace(&mut self.is_tracking, true)
    }

    /// Marks tracking as stopped; returns `false` if it already was.
    pub fn stop(&mut self) -> bool {
        std::mem::replace(&mut self.is_tracking, false)
    }
}

/// Start/stop lifecycle. Both transitions are idempotent.
pub trait Tracker {
    fn start_tracking(&mut self) -> Result<(), TrackingError>;

    fn stop_tracking(&mut self) -> Result<(), TrackingError>;

    fn is_tracking(&self) -> bool;

    /// Starts tracking and returns a scope that stops it exactly once on every exit path.
    fn track(&mut self) -> Result<TrackingScope<'_, Self>, TrackingError>
    where
        Self: Sized,
    {
        self.start_tracking()?;
        debug!("starting to track");
        Ok(TrackingScope {
            tracker: self,
            stopped: false,
        })
    }

    /// Runs `body` while tracking. Tracking is stopped before `body`'s error propagates;
    /// a teardown failure is reported only when `body` itself succeeded.
    fn tracked<R, E, F>(&mut self, body: F) -> Result<R, E>
    where
        Self: Sized,
        E: From<TrackingError>,
        F: FnOnce(&mut Self) -> Result<R, E>,
    {
        let mut scope = self.track()?;
        match body(&mut *scope) {
            Ok(value) => {
                scope.finish()?;
                Ok(value)
            }
            Err(err) => {
                drop(scope);
                Err(err)
            }
        }
    }
}

/// Active tracking session; derefs to the tracker.
///
/// Dropping the scope stops tracking and logs any teardown failure. Use
/// [`TrackingScope::finish`] to observe that failure instead.
pub struct TrackingScope<'a, T: Tracker> {
    tracker: &'a mut T,
    stopped: bool,
}

impl<T: Tracker> TrackingScope<'_, T> {
    pub fn finish(mut self) -> Result<(), TrackingError> {
        self.stopped = true;
        debug!("tracking done, stopping");
        self.tracker.stop_tracking()
    }
}

impl<T: Tracker> Deref for TrackingScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.tracker
    }
}

impl<T: Tracker> DerefMut for TrackingScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.tracker
    }
}

impl<T: Tracker> Drop for TrackingScope<'_, T> {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        debug!("tracking scope dropped, stopping");
        if let Err(err) = self.tracker.stop_tracking() {
            warn!(error = %err, "failed to stop tracking");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        state: TrackingState,
        starts: usize,
        stops: usize,
    }

    impl Tracker for Counting {
        fn start_tracking(&mut self) -> Result<(), TrackingError> {
            if self.state.start() {
                self.starts += 1;
            }
            Ok(())
        }

        fn stop_tracking(&mut self) -> Result<(), TrackingError> {
            if self.state.stop() {
                self.stops += 1;
            }
            Ok(())
        }

        fn is_tracking(&self) -> bool {
            self.state.is_tracking()
        }
    }

    #[test]
    fn scope_stops_on_drop() {
        let mut tracker = Counting::default();
        {
            let scope = tracker.track().unwrap();
            assert!(scope.is_tracking());
        }
        assert!(!tracker.is_tracking());
        assert_eq!((tracker.starts, tracker.stops), (1, 1));
    }

    #[test]
    fn finish_stops_exactly_once() {
        let mut tracker = Counting::default();
        tracker.track().unwrap().finish().unwrap();
        assert_eq!((tracker.starts, tracker.stops), (1, 1));
    }

    #[test]
    fn scope_stops_when_block_panics() {
        let mut tracker = Counting::default();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = tracker.track().unwrap();
            panic!("user block failed");
        }));
        assert!(outcome.is_err());
        assert!(!tracker.is_tracking());
        assert_eq!(tracker.stops, 1);
    }

    #[test]
    fn tracked_stops_before_propagating_body_error() {
        let mut tracker = Counting::default();
        let result: Result<(), anyhow::Error> = tracker.tracked(|inner| {
            assert!(inner.is_tracking());
            anyhow::bail!("body failed")
        });
        assert_eq!(result.unwrap_err().to_string(), "body failed");
        assert_eq!((tracker.starts, tracker.stops), (1, 1));
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let mut tracker = Counting::default();
        tracker.stop_tracking().unwrap();
        assert_eq!(tracker.stops, 0);
        assert!(!tracker.is_tracking());
    }
}
