//! Foreign-thread ("cgo") adoption (spec §4.9).
//!
//! Grounded on `original_source/go/src/pkg/runtime/cgocall.c`'s free-list
//! of pre-built worker records reused across repeated calls from the same
//! foreign thread, and its spin-lock-guarded free list. The original
//! guards that free list with a raw CAS on a sentinel value in a linked
//! list; this repo gets the same "cheap repeated adoption, no allocation
//! on the hot path" behavior from a `Mutex<Vec<_>>` instead of hand-rolled
//! unsafe pointer-chasing — noted in `DESIGN.md` as a safety-motivated
//! simplification, not a behavior change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::worker::{Worker, WorkerId};

/// Tracks OS threads that entered this runtime from the outside (neither
/// spawned as one of its own worker threads, spec §4.9).
pub struct CgoAdoption {
    free: Mutex<Vec<Arc<Worker>>>,
    next_id: AtomicU64,
    foreign_calls: AtomicU64,
}

impl CgoAdoption {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            // Adopted workers get ids above any statically-spawned worker
            // pool, distinguished by the high bit so `WorkerId` values
            // never collide between the two populations.
            next_id: AtomicU64::new(1 << 32),
            foreign_calls: AtomicU64::new(0),
        }
    }

    /// Adopt the calling OS thread: reuse a previously released worker
    /// record if one is free, otherwise build a fresh one (spec §4.9:
    /// "subsequent calls from the same foreign thread reuse its worker
    /// record from a free list rather than allocating again").
    pub fn adopt(&self) -> Arc<Worker> {
        self.foreign_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(w) = self.free.lock().unwrap().pop() {
            return w;
        }
        let id: WorkerId = self.next_id.fetch_add(1, Ordering::Relaxed) as WorkerId;
        Arc::new(Worker::new(id))
    }

    /// Release a worker record back to the free list when the foreign
    /// thread is done calling into the runtime (spec §4.9).
    pub fn release(&self, worker: Arc<Worker>) {
        worker.unbind_slot();
        worker.set_current_task(None);
        self.free.lock().unwrap().push(worker);
    }

    /// Total number of `adopt` calls made, mirroring `cgocall.c`'s foreign
    /// call counter (spec §11).
    pub fn foreign_call_count(&self) -> u64 {
        self.foreign_calls.load(Ordering::Relaxed)
    }
}

impl Default for CgoAdoption {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_builds_a_fresh_worker_when_free_list_is_empty() {
        let cgo = CgoAdoption::new();
        let w = cgo.adopt();
        assert!(w.bound_slot().is_none());
        assert_eq!(cgo.foreign_call_count(), 1);
    }

    #[test]
    fn release_then_adopt_reuses_the_same_worker_record() {
        let cgo = CgoAdoption::new();
        let w1 = cgo.adopt();
        let id = w1.id();
        cgo.release(w1);
        let w2 = cgo.adopt();
        assert_eq!(w2.id(), id);
        assert_eq!(cgo.foreign_call_count(), 2);
    }

    #[test]
    fn adopted_worker_ids_never_collide_with_static_pool() {
        let cgo = CgoAdoption::new();
        let w = cgo.adopt();
        assert!(w.id() >= (1usize << 32));
    }
}
