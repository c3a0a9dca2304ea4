//! The syscall hand-off protocol (spec §4.4).
//!
//! No direct teacher analog — `lumen-runtime`'s tasks never block the OS
//! thread they run on in a way the scheduler needs to react to. Built
//! directly from the spec's fast/slow path description and from
//! `original_source/go/src/pkg/runtime/proc.c`'s `entersyscall`/
//! `exitsyscall` for the exact shape of the fast-path CAS. The slow paths
//! (global re-enqueue, parking, acquiring a fresh slot) need runtime-wide
//! state (the idle-slot pool, the global queue) that this module doesn't
//! own, so they're expressed here as the CAS primitives plus an outcome
//! enum; `Runtime::worker_loop` (`runtime.rs`) performs the orchestration
//! and calls back into these functions at each step.

use crate::slot::{Slot, SlotStatus};

/// What a worker must do after `enter_syscall`/`enter_syscall_blocking`.
/// Entering a syscall never fails — the slot simply becomes available for
/// the monitor to retake (spec §4.4) — so this exists mainly to record
/// whether the blocking hint was given.
pub struct EnterSyscallToken {
    pub blocking_hint: bool,
}

/// Mark `slot` as being in a syscall (spec §4.4's "fast path: a lock-free
/// CAS from Running to Syscall"). Always succeeds when called on a slot
/// the caller legitimately owns (status is `Running`); returns `false`
/// only if the slot was found in some other status, which indicates a
/// caller bug rather than contention (a slot is never raced on between
/// its one bound worker entering and anyone else).
pub fn enter_syscall(slot: &Slot) -> bool {
    let ok = slot.compare_exchange_status(SlotStatus::Running, SlotStatus::Syscall);
    if ok {
        slot.mark_syscall_entered();
    }
    ok
}

/// Like [`enter_syscall`], but additionally signals the monitor that this
/// syscall is expected to block for a while, making the slot eligible for
/// immediate retake rather than waiting out the usual grace period
/// (spec §4.4: "a blocking hint lets the monitor retake it immediately
/// instead of waiting for the usual grace period").
pub fn enter_syscall_blocking(slot: &Slot) -> EnterSyscallToken {
    let ok = enter_syscall(slot);
    EnterSyscallToken { blocking_hint: ok }
}

/// What a worker must do after attempting to leave a syscall.
pub enum ExitSyscallOutcome {
    /// The fast-path CAS won: this worker still owns `slot`, now back in
    /// `Running`. Continue running the task that made the syscall.
    ReacquiredSameSlot,
    /// Another worker (via the monitor) already retook this slot while it
    /// was in `Syscall`. The calling worker must either acquire a
    /// different idle slot or, failing that, push its task onto the
    /// global queue and park (spec §4.4's slow path).
    SlotWasRetaken,
}

/// Attempt to leave a syscall (spec §4.4's "fast path: CAS back to
/// Running; slow path on failure").
pub fn exit_syscall(slot: &Slot) -> ExitSyscallOutcome {
    if slot.compare_exchange_status(SlotStatus::Syscall, SlotStatus::Running) {
        slot.clear_syscall_entered();
        ExitSyscallOutcome::ReacquiredSameSlot
    } else {
        ExitSyscallOutcome::SlotWasRetaken
    }
}
