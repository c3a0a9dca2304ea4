//! Process-wide configuration and the `MAXPROCS` env/CLI surface (spec §6).
//!
//! Grounded on the teacher's `std::env::var` reads (e.g.
//! `lumen-cli/src/build_script.rs`'s `NUM_JOBS`/`TARGET` parsing) and on
//! `scheduler.rs::Scheduler::new`'s `num_cpus::get().max(1)` fallback when
//! no explicit worker count is given.

use std::time::Duration;

/// Tunable parameters for a [`crate::runtime::Runtime`].
///
/// All fields have spec-mandated defaults (§2, §4.1, §4.7, §5, §11) but are
/// left overridable so tests can shrink timings and capacities instead of
/// waiting on production-scale numbers.
#[derive(Debug, Clone)]
pub struct Config {
    /// The admission cap (`slotCount`). Sourced from `MAXPROCS` by
    /// [`Config::from_env`], or set explicitly by [`Config::with_slots`].
    pub slots: usize,
    /// Initial capacity of each slot's local ring (spec §4.1: "a common
    /// choice is 256").
    pub local_ring_capacity: usize,
    /// Bound on a slot's local free-task cache before spilling half to the
    /// global cache (spec §4.1: "typical: 64 local").
    pub free_cache_local_bound: usize,
    /// Minimum stack size handed to a freshly allocated task (descriptive
    /// bookkeeping only — see `DESIGN.md` Open Question #3).
    pub min_stack_size: usize,
    /// Reserve subtracted from `min_stack_size` when checking spawn
    /// argument sizes (spec §4.2, §11: originally `StackMin - 1024`).
    pub stack_reserve: usize,
    /// The monitor's minimum adaptive sleep (spec §5: 20 µs).
    pub monitor_min_sleep: Duration,
    /// The monitor's maximum adaptive sleep (spec §5: 10 ms).
    pub monitor_max_sleep: Duration,
    /// Minimum interval between non-blocking network polls (spec §4.7: 10 ms).
    pub netpoll_interval: Duration,
}

impl Config {
    /// Hard clamp on the admission cap, mirroring the original's
    /// `MaxGomaxprocs = 1<<8` (spec §11).
    pub const MAX_SLOTS: usize = 256;

    /// Hard clamp on GC helper workers (spec §6's `gcHelperCount()`: "min(
    /// slotCount, physicalCpus, MaxGcProc, idleWorkers+1)"), mirroring the
    /// original's `MaxGcproc`.
    pub const MAX_GC_PROC: usize = 32;

    const DEFAULT_LOCAL_RING_CAPACITY: usize = 256;
    const DEFAULT_FREE_CACHE_LOCAL_BOUND: usize = 64;
    const DEFAULT_MIN_STACK_SIZE: usize = 8 * 1024;
    const DEFAULT_STACK_RESERVE: usize = 1024;

    /// Build a [`Config`] with an explicit slot count, clamped to
    /// [`Config::MAX_SLOTS`] and floored at 1.
    pub fn with_slots(slots: usize) -> Self {
        Self {
            slots: slots.clamp(1, Self::MAX_SLOTS),
            local_ring_capacity: Self::DEFAULT_LOCAL_RING_CAPACITY,
            free_cache_local_bound: Self::DEFAULT_FREE_CACHE_LOCAL_BOUND,
            min_stack_size: Self::DEFAULT_MIN_STACK_SIZE,
            stack_reserve: Self::DEFAULT_STACK_RESERVE,
            monitor_min_sleep: Duration::from_micros(20),
            monitor_max_sleep: Duration::from_millis(10),
            netpoll_interval: Duration::from_millis(10),
        }
    }

    /// Read `MAXPROCS` from the environment, clamping it to
    /// [`Config::MAX_SLOTS`]; fall back to the number of logical CPUs (at
    /// least 1) when unset or unparsable, matching `Scheduler::new(0)`'s
    /// behavior in the teacher crate.
    pub fn from_env() -> Self {
        let slots = std::env::var("MAXPROCS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(|| num_cpus::get().max(1));
        Self::with_slots(slots)
    }

    /// The effective argument-size ceiling for [`crate::runtime::Runtime::spawn`]
    /// (spec §4.2's "argument size exceeds the minimum stack minus a fixed
    /// reserve").
    pub fn max_spawn_args(&self) -> usize {
        self.min_stack_size.saturating_sub(self.stack_reserve)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_slots(num_cpus::get().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_slots_clamps_to_max() {
        let cfg = Config::with_slots(10_000);
        assert_eq!(cfg.slots, Config::MAX_SLOTS);
    }

    #[test]
    fn with_slots_floors_at_one() {
        let cfg = Config::with_slots(0);
        assert_eq!(cfg.slots, 1);
    }

    #[test]
    fn max_spawn_args_subtracts_reserve() {
        let cfg = Config::with_slots(1);
        assert_eq!(
            cfg.max_spawn_args(),
            cfg.min_stack_size - cfg.stack_reserve
        );
    }

    #[test]
    fn from_env_falls_back_without_maxprocs() {
        // SAFETY-adjacent only in the sense that env vars are process
        // global; this test doesn't run concurrently with others that set
        // MAXPROCS (none in this crate do).
        std::env::remove_var("MAXPROCS");
        let cfg = Config::from_env();
        assert!(cfg.slots >= 1);
        assert!(cfg.slots <= Config::MAX_SLOTS);
    }

    #[test]
    fn from_env_reads_and_clamps_maxprocs() {
        std::env::set_var("MAXPROCS", "99999");
        let cfg = Config::from_env();
        assert_eq!(cfg.slots, Config::MAX_SLOTS);
        std::env::remove_var("MAXPROCS");
    }
}
