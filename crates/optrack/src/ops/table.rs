//! Name-indexed dispatch table for operations.
//!
//! Callers dispatch by name through [`OpTable::call`], so replacing an entry redirects
//! every subsequent call. Tracking sessions use that to install hooks; they claim the
//! names they replace so overlapping sessions on the same table are rejected.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use anyhow::Result;

use super::{CallArgs, OpRef};
use crate::error::TrackingError;
use crate::value::Value;

#[derive(Default)]
pub struct OpTable {
    entries: RwLock<HashMap<String, OpRef>>,
    claims: Mutex<BTreeSet<String>>,
}

static GLOBAL_TABLE: OnceLock<Arc<OpTable>> = OnceLock::new();

impl OpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide table shared by everything that does not bring its own.
    pub fn global() -> Arc<OpTable> {
        Arc::clone(GLOBAL_TABLE.get_or_init(|| Arc::new(OpTable::new())))
    }

    /// Registers `op` under its own name and returns the entry it replaced, if any.
    pub fn register(&self, op: OpRef) -> Option<OpRef> {
        let name = op.name().to_string();
        self.entries
            .write()
            .expect("op table lock poisoned")
            .insert(name, op)
    }

    pub fn unregister(&self, name: &str) -> Option<OpRef> {
        self.entries
            .write()
            .expect("op table lock poisoned")
            .remove(name)
    }

    /// Returns the entry currently dispatched for `name`.
    pub fn get(&self, name: &str) -> Option<OpRef> {
        self.entries
            .read()
            .expect("op table lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("op table lock poisoned")
            .contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .expect("op table lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Dispatches `name` to whatever entry is currently installed.
    ///
    /// The table lock is released before the call, so operations may dispatch nested
    /// operations and hooks may be swapped while a call is in flight.
    pub fn call(&self, name: &str, args: &CallArgs) -> Result<Value> {
        let op = self.get(name).ok_or_else(|| TrackingError::UnknownOperation {
            name: name.to_string(),
        })?;
        op.call(args)
    }

    /// Swaps the entry for an already registered `name`, returning the previous one.
    pub(crate) fn replace(&self, name: &str, op: OpRef) -> Result<OpRef, TrackingError> {
        let mut entries = self.entries.write().expect("op table lock poisoned");
        match entries.get_mut(name) {
            Some(slot) => Ok(std::mem::replace(slot, op)),
            None => Err(TrackingError::UnknownOperation {
                name: name.to_string(),
            }),
        }
    }

    /// Claims every name for one tracking session; all or nothing.
    pub(crate) fn claim(&self, names: &[String]) -> Result<(), TrackingError> {
        let mut claims = self.claims.lock().expect("op table claim lock poisoned");
        if let Some(taken) = names.iter().find(|name| claims.contains(*name)) {
            return Err(TrackingError::AlreadyTracked {
                name: taken.clone(),
            });
        }
        claims.extend(names.iter().cloned());
        Ok(())
    }

    pub(crate) fn release(&self, names: &[String]) {
        let mut claims = self.claims.lock().expect("op table claim lock poisoned");
        for name in names {
            claims.remove(name);
        }
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.claims
            .lock()
            .expect("op table claim lock poisoned")
            .contains(name)
    }
}
