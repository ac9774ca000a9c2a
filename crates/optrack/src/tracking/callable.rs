//! Installs hook operations into a dispatch table and restores the originals.

use std::sync::Arc;

use tracing::{debug, warn};

use super::base::{Tracker, TrackingState};
use crate::error::TrackingError;
use crate::ops::{OpRef, OpTable};

/// Builds the replacement installed in place of an original operation.
pub trait HookFactory: Send + Sync {
    fn make_hook(&self, original: OpRef) -> OpRef;
}

impl<F> HookFactory for F
where
    F: Fn(OpRef) -> OpRef + Send + Sync,
{
    fn make_hook(&self, original: OpRef) -> OpRef {
        self(original)
    }
}

/// Which table entries a [`CallableTracker`] manages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetSet {
    /// Every name registered when tracking starts.
    #[default]
    All,
    Named(Vec<String>),
}

impl TargetSet {
    fn resolve(&self, table: &OpTable) -> Vec<String> {
        match self {
            TargetSet::All => table.names(),
            TargetSet::Named(names) => {
                let mut names = names.clone();
                names.sort();
                names.dedup();
                names
            }
        }
    }
}

struct Installed {
    name: String,
    original: OpRef,
}

/// Swaps hooks into an [`OpTable`] while tracking and puts the originals back afterwards.
///
/// While tracking, the managed names are claimed on the table, so a second tracker with
/// an overlapping target set fails to start.
pub struct CallableTracker<F: HookFactory> {
    state: TrackingState,
    table: Arc<OpTable>,
    targets: TargetSet,
    factory: F,
    claimed: Vec<String>,
    installed: Vec<Installed>,
}

impl<F: HookFactory> CallableTracker<F> {
    pub fn new(table: Arc<OpTable>, targets: TargetSet, factory: F) -> Self {
        CallableTracker {
            state: TrackingState::default(),
            table,
            targets,
            factory,
            claimed: Vec::new(),
            installed: Vec::new(),
        }
    }

    pub fn table(&self) -> &Arc<OpTable> {
        &self.table
    }

    /// Names currently replaced by hooks.
    pub fn installed_names(&self) -> Vec<&str> {
        self.installed.iter().map(|entry| entry.name.as_str()).collect()
    }

    fn install(&mut self, names: &[String]) -> Result<(), TrackingError> {
        for name in names {
            let original = self.table.get(name).ok_or_else(|| TrackingError::Install {
                name: name.clone(),
                reason: "operation is not registered".to_string(),
            })?;
            let hook = self.factory.make_hook(Arc::clone(&original));
            self.table
                .replace(name, hook)
                .map_err(|err| TrackingError::Install {
                    name: name.clone(),
                    reason: err.to_string(),
                })?;
            self.installed.push(Installed {
                name: name.clone(),
                original,
            });
        }
        Ok(())
    }

    /// Puts every original back, continuing past failures. Returns the names that failed.
    fn restore_all(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        for entry in self.installed.drain(..).rev() {
            if let Err(err) = self.table.replace(&entry.name, entry.original) {
                warn!(op = %entry.name, error = %err, "failed to restore operation");
                failed.push(entry.name);
            }
        }
        failed
    }

    fn release_claim(&mut self) {
        let claimed = std::mem::take(&mut self.claimed);
        self.table.release(&claimed);
    }
}

impl<F: HookFactory> Tracker for CallableTracker<F> {
    fn start_tracking(&mut self) -> Result<(), TrackingError> {
        if self.state.is_tracking() {
            return Ok(());
        }
        let names = self.targets.resolve(&self.table);
        self.table.claim(&names)?;
        self.claimed = names.clone();

        if let Err(err) = self.install(&names) {
            let failed = self.restore_all();
            if !failed.is_empty() {
                warn!(?failed, "rollback after failed installation left hooks behind");
            }
            self.release_claim();
            return Err(err);
        }

        self.state.start();
        debug!(hooks = names.len(), "installed operation hooks");
        Ok(())
    }

    fn stop_tracking(&mut self) -> Result<(), TrackingError> {
        if !self.state.stop() {
            return Ok(());
        }
        let restored = self.installed.len();
        let failed = self.restore_all();
        self.release_claim();
        if failed.is_empty() {
            debug!(restored, "restored original operations");
            Ok(())
        } else {
            Err(TrackingError::Restore { failed })
        }
    }

    fn is_tracking(&self) -> bool {
        self.state.is_tracking()
    }
}

impl<F: HookFactory> Drop for CallableTracker<F> {
    fn drop(&mut self) {
        if let Err(err) = self.stop_tracking() {
            warn!(error = %err, "operation hooks were not fully removed");
        }
    }
}
