//! The monitor thread (spec §4.4, §4.7, §5, §11): retakes slots stuck in
//! a syscall, drives non-blocking network polling, and backs off with an
//! adaptive sleep when there's nothing to do.
//!
//! Grounded on `original_source/go/src/pkg/runtime/proc.c`'s `sysmon`:
//! the adaptive delay starting at 20µs and doubling up to a 10ms cap
//! (spec §5, §11), and the retake-stuck-syscall scan. The teacher has no
//! analogous background thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::id::TaskId;
use crate::netpoll::{BlockingPollGate, SharedNetPoller};
use crate::slot::{Slot, SlotId, SlotStatus};

/// How long a slot may sit in `Syscall` before the monitor reclaims it
/// for other work (spec §4.4's "grace period"), absent a blocking hint.
pub const DEFAULT_RETAKE_THRESHOLD: Duration = Duration::from_millis(20);

/// What happened during one [`Monitor::tick`].
#[derive(Debug, Default)]
pub struct MonitorTick {
    /// Slots reclaimed from a stuck syscall, now `Idle` and pushed back
    /// onto the idle-slot pool.
    pub retaken: Vec<SlotId>,
    /// Tasks made runnable by this tick's network poll.
    pub woken: Vec<TaskId>,
}

/// Adaptive backoff: starts at `min`, doubles on an empty tick, caps at
/// `max`, and resets to `min` the moment any tick does real work
/// (spec §5: "20µs doubling to a 10ms cap").
pub struct AdaptiveSleep {
    min: Duration,
    max: Duration,
    current_nanos: AtomicU64,
}

impl AdaptiveSleep {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current_nanos: AtomicU64::new(min.as_nanos() as u64),
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_nanos(self.current_nanos.load(Ordering::Relaxed))
    }

    pub fn note_idle(&self) {
        let doubled = (self.current().as_nanos() as u64).saturating_mul(2);
        let capped = doubled.min(self.max.as_nanos() as u64);
        self.current_nanos.store(capped, Ordering::Relaxed);
    }

    pub fn note_activity(&self) {
        self.current_nanos
            .store(self.min.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// The monitor's view of the world: every slot, the idle-slot pool it
/// returns reclaimed slots to, and the network poller it drives.
pub struct Monitor {
    slots: Arc<Vec<Arc<Slot>>>,
    idle_slots: Arc<Mutex<Vec<SlotId>>>,
    netpoller: SharedNetPoller,
    poll_gate: Arc<BlockingPollGate>,
    retake_threshold: Duration,
    pub sleep: AdaptiveSleep,
}

impl Monitor {
    pub fn new(
        slots: Arc<Vec<Arc<Slot>>>,
        idle_slots: Arc<Mutex<Vec<SlotId>>>,
        netpoller: SharedNetPoller,
        poll_gate: Arc<BlockingPollGate>,
        min_sleep: Duration,
        max_sleep: Duration,
    ) -> Self {
        Self {
            slots,
            idle_slots,
            netpoller,
            poll_gate,
            retake_threshold: DEFAULT_RETAKE_THRESHOLD,
            sleep: AdaptiveSleep::new(min_sleep, max_sleep),
        }
    }

    /// Scan every slot for one stuck in `Syscall` past the retake
    /// threshold, and reclaim it (spec §4.4).
    fn retake_stuck_slots(&self) -> Vec<SlotId> {
        let mut retaken = Vec::new();
        for slot in self.slots.iter() {
            if slot.status() != SlotStatus::Syscall {
                continue;
            }
            let stuck = slot
                .syscall_duration()
                .map(|d| d >= self.retake_threshold)
                .unwrap_or(false);
            if !stuck {
                continue;
            }
            if slot.compare_exchange_status(SlotStatus::Syscall, SlotStatus::Idle) {
                slot.clear_syscall_entered();
                slot.unbind_worker();
                self.idle_slots.lock().unwrap().push(slot.id());
                retaken.push(slot.id());
            }
        }
        retaken
    }

    /// Run one monitor iteration: retake any stuck slots, then take a
    /// non-blocking network poll (spec §4.7 — the monitor never takes the
    /// single blocking-poller role itself, since that would prevent it
    /// from ever running its other duties).
    pub fn tick(&self) -> MonitorTick {
        let retaken = self.retake_stuck_slots();
        let woken = self.netpoller.poll_nonblocking();

        if retaken.is_empty() && woken.is_empty() {
            self.sleep.note_idle();
        } else {
            self.sleep.note_activity();
        }

        MonitorTick { retaken, woken }
    }

    pub fn is_blocking_poller(&self) -> bool {
        self.poll_gate.is_held()
    }
}
