//! Process-wide set of live forwarding process groups.
//!
//! Bookkeeping only: each session owns and tears down its own process.
//! The set is consulted once, at shutdown, to kill anything a session
//! failed to clean up.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static GLOBAL: LazyLock<Arc<ProcessRegistry>> = LazyLock::new(|| Arc::new(ProcessRegistry::new()));

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    /// Root pid -> descendants tracked while it was alive
    pids: Mutex<HashMap<u32, Vec<u32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every launcher in this process
    pub fn global() -> Arc<ProcessRegistry> {
        GLOBAL.clone()
    }

    pub fn register(&self, pid: u32) {
        self.pids.lock().entry(pid).or_default();
    }

    /// Record the descendants seen for a registered root
    pub fn track(&self, pid: u32, descendants: &[u32]) {
        if let Some(known) = self.pids.lock().get_mut(&pid) {
            *known = descendants.to_vec();
        }
    }

    pub fn deregister(&self, pid: u32) {
        self.pids.lock().remove(&pid);
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.lock().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.pids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.lock().is_empty()
    }

    /// Force-kill every registered group and clear the set.
    /// Returns the number of groups signalled.
    pub fn sweep(&self) -> usize {
        let pids: Vec<(u32, Vec<u32>)> = self.pids.lock().drain().collect();
        if !pids.is_empty() {
            tracing::warn!("Sweeping {} leftover forwarding process group(s)", pids.len());
        }
        for (pid, known) in &pids {
            super::tree::force_kill_group(*pid, known);
        }
        pids.len()
    }
}
