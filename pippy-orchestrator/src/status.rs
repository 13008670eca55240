//! Stage status map
//!
//! Live per-stage run records plus the run's top-level state, all behind
//! one RwLock. Every write rebuilds a deep-copied snapshot so renderers can
//! read arbitrarily often without contending with the tick.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use pippy_core::{RunState, StageState};

/// In-memory state of one stage's run (and, during rollback, its shadow)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRecord {
    pub state: StageState,
    pub run_url: String,
    pub run_id: String,
    pub title: String,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub rollback: Option<Box<RunRecord>>,
    pub reason: String,
    pub approved_by: String,
    pub version: String,
    pub inputs: HashMap<String, String>,
    pub concurrent_run_id: String,
}

#[derive(Default)]
struct StatusInner {
    live: HashMap<String, RunRecord>,
    state: RunState,
    cache: HashMap<String, RunRecord>,
}

/// Concurrency-safe stage-name → run-record map
#[derive(Default)]
pub struct StatusMap {
    inner: RwLock<StatusInner>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record for `key` and rebuild the snapshot cache.
    pub fn set(&self, key: &str, value: RunRecord) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.live.insert(key.to_string(), value);
        let snapshot = inner.live.clone();
        inner.cache = snapshot;
    }

    /// Copy of the live record for `key`; empty record when absent.
    pub fn get(&self, key: &str) -> RunRecord {
        self.inner
            .read()
            .expect("status lock poisoned")
            .live
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Record from the snapshot cache, for render loops.
    pub fn get_cache(&self, key: &str) -> RunRecord {
        self.inner
            .read()
            .expect("status lock poisoned")
            .cache
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Full snapshot, for render loops.
    pub fn snapshot(&self) -> HashMap<String, RunRecord> {
        self.inner.read().expect("status lock poisoned").cache.clone()
    }

    pub fn update_state(&self, state: RunState) {
        self.inner.write().expect("status lock poisoned").state = state;
    }

    pub fn get_state(&self) -> RunState {
        self.inner.read().expect("status lock poisoned").state
    }
}
