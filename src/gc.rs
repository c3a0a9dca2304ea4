//! Garbage-collector integration points (spec §6): the stop-the-world
//! trigger, left pluggable since this crate provides a scheduler, not a
//! collector. The helper-worker count the collector is handed each cycle
//! is computed by the scheduler itself (`Runtime::gc_helper_count`, spec
//! §6's `gcHelperCount()`), not by the collector.
//!
//! There is no teacher analog (`lumen-runtime` has no GC); shaped as a
//! trait the same way `netpoll.rs::NetPoller` is, so an embedder supplies
//! its own collector while this crate only needs to know when to pause the
//! world and how many workers to lend it.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A pluggable collector that can request a stop-the-world pause and use
/// some number of workers as helpers for the duration (spec §6).
pub trait Collector: Send + Sync {
    /// Called once the world is stopped (spec §4.5) with the helper count
    /// the scheduler computed via `gcHelperCount()`; return when the
    /// collection work for this cycle is done so the runtime can resume.
    fn collect(&self, helpers: usize);
}

/// A collector that does nothing; the default for a `Runtime` with no
/// registered collector, so `Runtime::run_stop_the_world_cycle` is always safe to
/// call even absent a real GC.
#[derive(Debug, Default)]
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn collect(&self, _helpers: usize) {}
}

/// Counts collection cycles, useful for tests asserting a collector ran
/// the expected number of times.
#[derive(Debug, Default)]
pub struct CountingCollector {
    cycles: AtomicUsize,
}

impl CountingCollector {
    pub fn new() -> Self {
        Self {
            cycles: AtomicUsize::new(0),
        }
    }

    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::Acquire)
    }
}

impl Collector for CountingCollector {
    fn collect(&self, _helpers: usize) {
        self.cycles.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_collector_accepts_any_helper_count() {
        let c = NoopCollector;
        c.collect(8);
    }

    #[test]
    fn counting_collector_tracks_cycles() {
        let c = CountingCollector::new();
        c.collect(4);
        c.collect(4);
        assert_eq!(c.cycles(), 2);
    }
}
