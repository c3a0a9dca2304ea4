//! Stop-the-world barrier protocol (spec §4.5).
//!
//! No teacher analog. Shaped like the rest of this crate's coordination
//! primitives (`netpoll::BlockingPollGate`, `slot::Slot`'s atomic status):
//! a flag workers check at the cooperative safe points the spec names
//! (worker-loop top, syscall entry/exit, task exit, stack-growth check),
//! plus a countdown so the requester knows when every slot has reached
//! `GcStop` (spec §4.5 steps 1-2, 6-7). This module only tracks the
//! request flag and the ack countdown; walking `Slot` statuses to decide
//! who can transition unilaterally (idle-stack and `Syscall` slots) versus
//! who must transition itself (a slot's owning worker) is `Runtime`'s job,
//! since only `Runtime` has the slot table and the idle-slot pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Coordinates a stop-the-world pause across every slot (spec §4.5).
pub struct StwController {
    requested: AtomicBool,
    acked: AtomicUsize,
    participants: AtomicUsize,
    gate: Mutex<()>,
    cvar: Condvar,
}

impl StwController {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            acked: AtomicUsize::new(0),
            participants: AtomicUsize::new(0),
            gate: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Raise the stop-the-world flag and set the countdown to
    /// `participants` (spec §4.5 steps 1-2: "acquire the stop semaphore;
    /// set a global waiting flag; set stopWait = slotCount"). Does not
    /// block — the caller transitions whatever slots it can unilaterally
    /// (see `Runtime::begin_stop_the_world`) before calling
    /// [`StwController::wait_until_acked`].
    pub fn begin(&self, participants: usize) {
        self.participants.store(participants, Ordering::Release);
        self.acked.store(0, Ordering::Release);
        self.requested.store(true, Ordering::Release);
    }

    /// Ack one slot's transition to `GcStop`, whether the requester forced
    /// it directly (an idle or stuck-syscall slot) or a worker transitioned
    /// its own slot cooperatively (spec §4.5 step 3).
    pub fn ack(&self) {
        let _guard = self.gate.lock().unwrap();
        self.acked.fetch_add(1, Ordering::AcqRel);
        self.cvar.notify_all();
    }

    /// Block until every participant slot has acked (spec §4.5 steps 6-7:
    /// "if stopWait > 0, sleep on the stop wake-object; return when every
    /// slot is GcStop").
    pub fn wait_until_acked(&self) {
        let guard = self.gate.lock().unwrap();
        let participants = self.participants.load(Ordering::Acquire);
        let _unused = self
            .cvar
            .wait_timeout_while(guard, Duration::from_secs(30), |_| {
                self.acked.load(Ordering::Acquire) < participants
            })
            .unwrap();
    }

    /// Clear the stop-the-world flag (spec §4.5's "starttheworld"),
    /// releasing every worker parked in its cooperative wait loop.
    pub fn end(&self) {
        self.requested.store(false, Ordering::Release);
        self.cvar.notify_all();
    }
}

impl Default for StwController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_until_acked_blocks_until_every_participant_acks() {
        let stw = Arc::new(StwController::new());
        let workers = 4;
        stw.begin(workers);

        let mut handles = Vec::new();
        for _ in 0..workers {
            let stw = Arc::clone(&stw);
            handles.push(thread::spawn(move || {
                while !stw.is_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
                stw.ack();
            }));
        }

        let start = Instant::now();
        stw.wait_until_acked();
        assert!(start.elapsed() < Duration::from_secs(5));

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn end_clears_request_flag() {
        let stw = StwController::new();
        stw.requested.store(true, Ordering::SeqCst);
        stw.end();
        assert!(!stw.is_requested());
    }

    #[test]
    fn wait_until_acked_returns_immediately_with_zero_participants() {
        let stw = StwController::new();
        stw.begin(0);
        let start = Instant::now();
        stw.wait_until_acked();
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
