//! Per-edge traversal bookkeeping shared across bridged nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::worker::WorkerId;

type Registry = BTreeMap<String, BTreeMap<WorkerId, u64>>;

/// Counts which workers touched a node's edges, keyed by the bridged form
/// of the node on the far side of the edge.
///
/// Cloning an `EdgeRegister` clones the *handle*, not the counters: all
/// clones observe the same registry. Bridging relies on this to make a
/// whole equivalence class of nodes share one set of registers.
#[derive(Clone, Default)]
pub struct EdgeRegister {
    inner: Arc<Mutex<Registry>>,
}

impl EdgeRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one touch of the edge toward `bridged_form` by `worker`.
    pub fn register(&self, bridged_form: &str, worker: &WorkerId) {
        let mut registry = self.inner.lock().unwrap();
        *registry
            .entry(bridged_form.to_owned())
            .or_default()
            .entry(worker.clone())
            .or_insert(0) += 1;
    }

    /// Workers recorded for one bridged form, or for any form when absent.
    pub fn get_workers(&self, bridged_form: Option<&str>) -> BTreeSet<WorkerId> {
        let registry = self.inner.lock().unwrap();
        match bridged_form {
            Some(form) => registry
                .get(form)
                .map(|workers| workers.keys().cloned().collect())
                .unwrap_or_default(),
            None => registry
                .values()
                .flat_map(|workers| workers.keys().cloned())
                .collect(),
        }
    }

    /// Total touches, optionally narrowed to one bridged form and/or one
    /// worker.
    pub fn get_counters(&self, bridged_form: Option<&str>, worker: Option<&WorkerId>) -> u64 {
        let registry = self.inner.lock().unwrap();
        let sum_workers = |workers: &BTreeMap<WorkerId, u64>| match worker {
            Some(id) => workers.get(id).copied().unwrap_or(0),
            None => workers.values().sum(),
        };
        match bridged_form {
            Some(form) => registry.get(form).map(sum_workers).unwrap_or(0),
            None => registry.values().map(sum_workers).sum(),
        }
    }

    /// Copy of the full registry for inspection.
    pub fn snapshot(&self) -> Registry {
        self.inner.lock().unwrap().clone()
    }

    /// Whether two handles point at the same registry.
    pub fn shares_storage_with(&self, other: &EdgeRegister) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EdgeRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EdgeRegister")
            .field(&self.snapshot())
            .finish()
    }
}
