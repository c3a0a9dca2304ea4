//! OS worker threads (spec §3, §4.3, §4.6).
//!
//! Grounded on `scheduler.rs::WorkerHandle` (an OS thread's `JoinHandle`
//! plus its stealer handle) for the OS-thread pairing, and on
//! `mailbox.rs`'s `crossbeam_channel`-backed wake-up for how a parked
//! worker is unparked from another thread: a single-slot channel plays
//! the role of the spec's "per-worker wait object" (spec §3), with
//! `try_send` from the waker side so a redundant wake (several pokes
//! before the worker next checks) never blocks the poker. Pin/lock
//! bookkeeping (spec §4.6) has no teacher analog — the teacher never pins
//! a process to a specific `WorkerHandle` — so it's built directly from
//! the spec.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::id::TaskId;

pub type WorkerId = usize;

/// One OS thread executing the worker loop (spec §4.3).
pub struct Worker {
    id: WorkerId,
    /// Slot index currently bound to this worker, or `usize::MAX` if this
    /// worker is parked without a slot (e.g. mid foreign-call adoption,
    /// spec §4.9).
    bound_slot: AtomicUsize,
    current_task: Mutex<Option<TaskId>>,
    /// A task pinned to this specific worker (spec §4.6) bypasses normal
    /// scheduling: only this worker may run it.
    pinned_task: Mutex<Option<TaskId>>,
    /// Set while this worker is actively spinning looking for work,
    /// instead of parked (spec §4.3's spinning-worker policy).
    spinning: AtomicBool,
    /// The per-worker wait object (spec §3): another thread wakes this
    /// worker by sending on `wake_tx`; this worker blocks (with a
    /// timeout, so it still notices shutdown and staged work) on
    /// `wake_rx`.
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    /// Count of external callers holding a lock against this worker
    /// running any task but its pinned one (spec §4.6).
    external_locks: AtomicUsize,
}

const UNBOUND: usize = usize::MAX;

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            id,
            bound_slot: AtomicUsize::new(UNBOUND),
            current_task: Mutex::new(None),
            pinned_task: Mutex::new(None),
            spinning: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            external_locks: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn bound_slot(&self) -> Option<usize> {
        match self.bound_slot.load(Ordering::Acquire) {
            UNBOUND => None,
            s => Some(s),
        }
    }

    pub fn bind_slot(&self, slot: usize) {
        self.bound_slot.store(slot, Ordering::Release);
    }

    pub fn unbind_slot(&self) {
        self.bound_slot.store(UNBOUND, Ordering::Release);
    }

    pub fn current_task(&self) -> Option<TaskId> {
        *self.current_task.lock().unwrap()
    }

    pub fn set_current_task(&self, task: Option<TaskId>) {
        *self.current_task.lock().unwrap() = task;
    }

    pub fn pinned_task(&self) -> Option<TaskId> {
        *self.pinned_task.lock().unwrap()
    }

    pub fn pin_task(&self, task: TaskId) {
        *self.pinned_task.lock().unwrap() = Some(task);
    }

    pub fn unpin_task(&self) {
        *self.pinned_task.lock().unwrap() = None;
    }

    pub fn is_locked(&self) -> bool {
        self.external_locks.load(Ordering::Acquire) > 0
    }

    /// Record that an external caller has locked this worker to its
    /// pinned task (spec §4.6); nests, mirroring `LockOSThread`'s
    /// reference-counted semantics in the original runtime.
    pub fn lock(&self) {
        self.external_locks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        self.external_locks.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_spinning(&self) -> bool {
        self.spinning.load(Ordering::Acquire)
    }

    pub fn set_spinning(&self, spinning: bool) {
        self.spinning.store(spinning, Ordering::Release);
    }

    /// Wake this worker if it's currently blocked in [`Worker::park_wake`].
    /// `try_send` rather than `send`: the channel is single-slot and
    /// already-pending wake-up is just as good as a second one, so a
    /// full channel (this worker already has a wake queued) is not an
    /// error.
    pub fn unpark(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Block for up to `timeout` waiting for [`Worker::unpark`], the
    /// scheduler's stand-in for `thread::park_timeout` (spec §4.3 step 5):
    /// a timeout rather than an indefinite wait so a parked worker still
    /// notices shutdown and staged admission-cap changes on its own
    /// cadence even if nobody ever wakes it directly.
    pub fn park_wake(&self, timeout: Duration) {
        let _ = self.wake_rx.recv_timeout(timeout);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("bound_slot", &self.bound_slot())
            .field("current_task", &self.current_task())
            .field("pinned_task", &self.pinned_task())
            .field("spinning", &self.is_spinning())
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// A handle to a spawned OS thread running `Runtime::worker_loop`, paired
/// with its `Worker` bookkeeping (spec §3's worker/OS-thread pairing;
/// grounded on `scheduler.rs::WorkerHandle`).
pub struct WorkerHandle {
    pub worker: Arc<Worker>,
    pub join_handle: Option<std::thread::JoinHandle<()>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unbound_and_unlocked() {
        let w = Worker::new(0);
        assert_eq!(w.bound_slot(), None);
        assert!(!w.is_locked());
        assert!(!w.is_spinning());
    }

    #[test]
    fn lock_nests_and_unlock_decrements() {
        let w = Worker::new(0);
        w.lock();
        w.lock();
        assert!(w.is_locked());
        w.unlock();
        assert!(w.is_locked());
        w.unlock();
        assert!(!w.is_locked());
    }

    #[test]
    fn pin_and_unpin_task() {
        let gen = crate::id::TaskIdGen::new();
        let w = Worker::new(0);
        let id = gen.next();
        w.pin_task(id);
        assert_eq!(w.pinned_task(), Some(id));
        w.unpin_task();
        assert_eq!(w.pinned_task(), None);
    }

    #[test]
    fn bind_unbind_slot() {
        let w = Worker::new(0);
        w.bind_slot(5);
        assert_eq!(w.bound_slot(), Some(5));
        w.unbind_slot();
        assert_eq!(w.bound_slot(), None);
    }

    #[test]
    fn park_wake_times_out_with_no_unpark() {
        let w = Worker::new(0);
        let start = std::time::Instant::now();
        w.park_wake(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn unpark_wakes_a_park_wake_call_from_another_thread() {
        let w = Arc::new(Worker::new(0));
        let w2 = Arc::clone(&w);
        let handle = std::thread::spawn(move || {
            w2.park_wake(Duration::from_secs(5));
        });
        std::thread::sleep(Duration::from_millis(10));
        let start = std::time::Instant::now();
        w.unpark();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn redundant_unpark_before_park_does_not_block_the_poker() {
        let w = Worker::new(0);
        w.unpark();
        w.unpark();
        let start = std::time::Instant::now();
        w.park_wake(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
