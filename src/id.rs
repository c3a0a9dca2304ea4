//! Monotonic task identity.
//!
//! Grounded on `process.rs::ProcessId` (the teacher's `AtomicU64`-backed
//! sequential id), generalized from "process" to "task".

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global source of unique task ids, one per [`crate::runtime::Runtime`].
#[derive(Debug)]
pub(crate) struct TaskIdGen {
    next: AtomicU64,
}

impl TaskIdGen {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A unique, opaque identifier for a task.
///
/// Ids are assigned sequentially from a monotonic generator and are never
/// reused, even when the underlying [`crate::task::Task`] allocation is
/// recycled through the free-task cache (spec §4.1).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstruct a `TaskId` from its raw value, for storing one inside an
    /// `AtomicU64` (e.g. `task.rs`'s recyclable `Task::id`, which is
    /// reassigned a fresh id on every reuse).
    pub(crate) fn from_raw(v: u64) -> Self {
        TaskId(v)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let gen = TaskIdGen::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a.as_u64() < b.as_u64());
        assert!(b.as_u64() < c.as_u64());
    }

    #[test]
    fn display_and_debug() {
        let gen = TaskIdGen::new();
        let id = gen.next();
        assert!(format!("{}", id).starts_with("task:"));
        assert!(format!("{:?}", id).starts_with("TaskId("));
    }

    #[test]
    fn spawn_then_drain_yields_dense_id_set() {
        // Mirrors spec §8's "Spawn-then-drain" round-trip property: spawning
        // N tasks from a fresh generator yields exactly the set {1..=N}.
        let gen = TaskIdGen::new();
        let n = 1000;
        let ids: Vec<u64> = (0..n).map(|_| gen.next().as_u64()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        let expected: Vec<u64> = (1..=n as u64).collect();
        assert_eq!(sorted, expected);
    }
}
