//! Deadlock detection (spec §4.8).
//!
//! Grounded on `original_source/go/src/pkg/runtime/proc.c`'s running-count
//! formula and its `// -1 for sysmon` comment (see `DESIGN.md` Open
//! Question #1, adopted here unconditionally): the monitor is itself an
//! OS thread but never counts as a running worker, so it's subtracted out
//! alongside idle and locked workers.

use crate::error::DeadlockKind;

/// Decide whether the scheduler is deadlocked, given a snapshot of its
/// worker accounting (spec §4.8).
///
/// `mcount` is the total number of live OS worker threads, `idle_workers`
/// how many currently hold no slot, `locked_workers` how many are pinned
/// to a specific task via `worker::Worker::lock` (spec §4.6 — excluded
/// because a locked worker can't be recruited to break the deadlock even
/// if it wanted to), and `any_task_waiting` whether at least one
/// non-background task is in `TaskStatus::Waiting` rather than simply
/// stuck with nothing to run.
///
/// Returns `None` when at least one worker could still be doing useful
/// work (`running > 0`, spec's exact formula — this is a count of
/// *workers*, not of live tasks: a pile of tasks parked forever is
/// precisely the deadlock this is meant to catch, so their mere existence
/// must not suppress the check). Background tasks (spec §4.8) are
/// excluded from `any_task_waiting` by the caller before this function is
/// invoked.
pub fn check(
    mcount: usize,
    idle_workers: usize,
    locked_workers: usize,
    any_task_waiting: bool,
) -> Option<DeadlockKind> {
    // "-1 for sysmon": the monitor thread is never a candidate runner.
    let running = (mcount as isize) - (idle_workers as isize) - (locked_workers as isize) - 1;
    if running > 0 {
        return None;
    }

    if any_task_waiting {
        Some(DeadlockKind::AllAsleep)
    } else {
        Some(DeadlockKind::AllBlocked)
    }
}
