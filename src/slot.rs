//! Processor slots — the admission-capped resource a worker must hold to
//! run tasks (spec §3, §4.4, §4.5).
//!
//! Grounded on the spec's slot/worker/task three-level model directly
//! (the teacher crate has no equivalent concept: its `WorkerHandle`s run
//! unconditionally, with no separate admission-controlled resource). The
//! per-slot local ring and free cache reuse `ring.rs`/`cache.rs`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cache::FreeCache;
use crate::ring::Ring;

/// A slot's observable state (spec §4.4/§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Not bound to any worker, or its worker has none of its own work.
    Idle,
    /// Bound to a worker actively running a task.
    Running,
    /// Bound to a worker whose task is in a blocking syscall; the slot
    /// itself is available for the monitor to reassign (spec §4.4).
    Syscall,
    /// Stopped for a stop-the-world cycle (spec §4.5).
    GcStop,
    /// Torn down (admission resize shrank the slot count, spec §4.5).
    Dead,
}

pub type SlotId = usize;

/// One admission-capped scheduling resource. `slots: Vec<Arc<Slot>>` in
/// `runtime.rs` is always exactly `Config::slots` long after the most
/// recent stop-the-world cycle applied a pending resize.
pub struct Slot {
    id: SlotId,
    status: AtomicUsize,
    /// Monotonic per-slot tick, advanced once per worker-loop iteration;
    /// used by the monitor to detect a slot stuck in the same syscall
    /// across two checks (spec §4.4, §5).
    tick: AtomicU64,
    /// Index into `Runtime::workers` of whichever worker currently holds
    /// this slot, or `usize::MAX` if unbound.
    bound_worker: AtomicUsize,
    pub local_ring: Ring,
    pub free_cache: FreeCache,
    /// When this slot entered `Syscall` status, so the monitor can measure
    /// how long it has been stuck there (spec §4.4, §5).
    syscall_started: Mutex<Option<Instant>>,
}

const UNBOUND: usize = usize::MAX;

fn status_to_tag(status: SlotStatus) -> usize {
    match status {
        SlotStatus::Idle => 0,
        SlotStatus::Running => 1,
        SlotStatus::Syscall => 2,
        SlotStatus::GcStop => 3,
        SlotStatus::Dead => 4,
    }
}

fn tag_to_status(tag: usize) -> SlotStatus {
    match tag {
        0 => SlotStatus::Idle,
        1 => SlotStatus::Running,
        2 => SlotStatus::Syscall,
        3 => SlotStatus::GcStop,
        _ => SlotStatus::Dead,
    }
}

impl Slot {
    pub fn new(id: SlotId, local_ring_capacity: usize, global_free: Arc<std::sync::Mutex<std::collections::VecDeque<Arc<crate::task::Task>>>>, local_free_bound: usize) -> Self {
        Self {
            id,
            status: AtomicUsize::new(status_to_tag(SlotStatus::Idle)),
            tick: AtomicU64::new(0),
            bound_worker: AtomicUsize::new(UNBOUND),
            local_ring: Ring::new(local_ring_capacity),
            free_cache: FreeCache::new(local_free_bound, global_free),
            syscall_started: Mutex::new(None),
        }
    }

    /// Record that this slot just entered `Syscall` status.
    pub fn mark_syscall_entered(&self) {
        *self.syscall_started.lock().unwrap() = Some(Instant::now());
    }

    pub fn clear_syscall_entered(&self) {
        *self.syscall_started.lock().unwrap() = None;
    }

    /// How long this slot has been continuously in `Syscall` status, if any.
    pub fn syscall_duration(&self) -> Option<std::time::Duration> {
        self.syscall_started.lock().unwrap().map(|t| t.elapsed())
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn status(&self) -> SlotStatus {
        tag_to_status(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SlotStatus) {
        self.status.store(status_to_tag(status), Ordering::Release);
    }

    /// Atomically move this slot from `from` to `to`, returning whether it
    /// succeeded — the fast-path CAS used by `syscall.rs`'s entersyscall
    /// and exitsyscall (spec §4.4).
    pub fn compare_exchange_status(&self, from: SlotStatus, to: SlotStatus) -> bool {
        self.status
            .compare_exchange(
                status_to_tag(from),
                status_to_tag(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn advance_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn bound_worker(&self) -> Option<usize> {
        match self.bound_worker.load(Ordering::Acquire) {
            UNBOUND => None,
            w => Some(w),
        }
    }

    pub fn bind_worker(&self, worker_index: usize) {
        self.bound_worker.store(worker_index, Ordering::Release);
    }

    pub fn unbind_worker(&self) {
        self.bound_worker.store(UNBOUND, Ordering::Release);
    }
}
