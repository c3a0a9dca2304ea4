//! Free-task caches: per-slot bounded, plus a global unbounded overflow
//! (spec §4.1).
//!
//! Shaped like `ring.rs`'s bound/spill logic (no direct teacher analog —
//! the teacher reallocates a fresh `Task` per `spawn`/`spawn_fn` call and
//! never recycles one). Recycling an already-allocated `Task` means
//! resetting its body via `Task::reset` instead of constructing a new one,
//! which is the whole point of the cache: avoid an allocation on every
//! spawn once the pool is warm.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::task::Task;

/// A slot-local bounded cache of dead tasks available for reuse, backed by
/// a global unbounded overflow shared across all slots.
pub struct FreeCache {
    local_bound: usize,
    local: Mutex<VecDeque<Arc<Task>>>,
    global: Arc<Mutex<VecDeque<Arc<Task>>>>,
}

impl FreeCache {
    pub fn new(local_bound: usize, global: Arc<Mutex<VecDeque<Arc<Task>>>>) -> Self {
        Self {
            local_bound,
            local: Mutex::new(VecDeque::new()),
            global,
        }
    }

    pub fn new_global() -> Arc<Mutex<VecDeque<Arc<Task>>>> {
        Arc::new(Mutex::new(VecDeque::new()))
    }

    /// Return a dead task to the cache. When the local cache is at
    /// capacity, spill half of it (the existing items, not including the
    /// one just returned) to the global cache first (spec §4.1: "typical:
    /// 64 local; spill half to the global cache when full").
    pub fn put(&self, task: Arc<Task>) {
        let mut local = self.local.lock().unwrap();
        if local.len() >= self.local_bound {
            let spill = local.len() / 2;
            let mut global = self.global.lock().unwrap();
            for _ in 0..spill {
                if let Some(t) = local.pop_front() {
                    global.push_back(t);
                }
            }
        }
        local.push_back(task);
    }

    /// Take a dead task for reuse: local cache first, then a batch refill
    /// from the global cache (spec §4.1: "an empty local cache refills
    /// from the global cache in a batch rather than one at a time").
    pub fn take(&self) -> Option<Arc<Task>> {
        let mut local = self.local.lock().unwrap();
        if let Some(t) = local.pop_front() {
            return Some(t);
        }
        let mut global = self.global.lock().unwrap();
        if global.is_empty() {
            return None;
        }
        let refill = (global.len() / 2 + 1).min(self.local_bound).min(global.len());
        for _ in 0..refill {
            if let Some(t) = global.pop_front() {
                local.push_back(t);
            }
        }
        local.pop_front()
    }

    pub fn local_len(&self) -> usize {
        self.local.lock().unwrap().len()
    }
}
