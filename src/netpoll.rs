//! Network readiness as an external collaborator (spec §4.7, §6).
//!
//! The teacher has no netpoller — this is built directly from the spec,
//! shaped as a trait (`NetPoller`) so embedders can plug in a real reactor
//! (mio, a raw epoll wrapper) the way `gc.rs::Collector` is also left
//! pluggable. `NoopNetPoller` and `ChannelNetPoller` are provided: the
//! former for embedders with no I/O of their own, the latter as a test
//! double that lets a test drive readiness deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::id::TaskId;

/// A task made runnable by a readiness event.
pub type Woken = TaskId;

/// Pluggable network readiness source (spec §4.7).
///
/// `poll_nonblocking` returns immediately with whatever is ready.
/// `poll_blocking` may block indefinitely; the monitor only ever calls it
/// from the single designated "blocking poller" role (spec §4.7's
/// single-blocking-poller-at-a-time rule), enforced by `Runtime`, not by
/// this trait.
pub trait NetPoller: Send + Sync {
    fn poll_nonblocking(&self) -> Vec<Woken>;
    fn poll_blocking(&self, timeout: Option<Duration>) -> Vec<Woken>;
}

/// A poller with no registered interest; always returns immediately with
/// nothing ready. The default for a `Runtime` that does no network I/O.
#[derive(Debug, Default)]
pub struct NoopNetPoller;

impl NetPoller for NoopNetPoller {
    fn poll_nonblocking(&self) -> Vec<Woken> {
        Vec::new()
    }

    fn poll_blocking(&self, timeout: Option<Duration>) -> Vec<Woken> {
        if let Some(d) = timeout {
            std::thread::sleep(d);
        }
        Vec::new()
    }
}

/// A test/demo poller: readiness is injected by calling `mark_ready`, and
/// consumed on the next `poll_nonblocking`/`poll_blocking` call.
#[derive(Debug, Default)]
pub struct ChannelNetPoller {
    ready: Mutex<Vec<Woken>>,
}

impl ChannelNetPoller {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_ready(&self, task: TaskId) {
        self.ready.lock().unwrap().push(task);
    }
}

impl NetPoller for ChannelNetPoller {
    fn poll_nonblocking(&self) -> Vec<Woken> {
        std::mem::take(&mut *self.ready.lock().unwrap())
    }

    fn poll_blocking(&self, timeout: Option<Duration>) -> Vec<Woken> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            {
                let mut ready = self.ready.lock().unwrap();
                if !ready.is_empty() {
                    return std::mem::take(&mut *ready);
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Vec::new();
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Enforces "at most one worker polls blocking at a time" (spec §4.7) via
/// a CAS on the last-poll timestamp: a worker may take the blocking-poller
/// role only if it wins the compare-exchange.
#[derive(Debug)]
pub struct BlockingPollGate {
    holder: AtomicU64,
}

const NO_HOLDER: u64 = 0;

impl BlockingPollGate {
    pub fn new() -> Self {
        Self {
            holder: AtomicU64::new(NO_HOLDER),
        }
    }

    /// Attempt to become the sole blocking poller, identified by
    /// `worker_id + 1` (so worker 0 doesn't collide with the `NO_HOLDER`
    /// sentinel).
    pub fn try_acquire(&self, worker_id: usize) -> bool {
        self.holder
            .compare_exchange(
                NO_HOLDER,
                worker_id as u64 + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn release(&self, worker_id: usize) {
        let _ = self.holder.compare_exchange(
            worker_id as u64 + 1,
            NO_HOLDER,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_held(&self) -> bool {
        self.holder.load(Ordering::Acquire) != NO_HOLDER
    }
}

impl Default for BlockingPollGate {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedNetPoller = Arc<dyn NetPoller>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TaskIdGen;

    #[test]
    fn channel_poller_returns_injected_readiness() {
        let gen = TaskIdGen::new();
        let poller = ChannelNetPoller::new();
        let id = gen.next();
        poller.mark_ready(id);
        let woken = poller.poll_nonblocking();
        assert_eq!(woken, vec![id]);
        assert!(poller.poll_nonblocking().is_empty());
    }

    #[test]
    fn noop_poller_returns_immediately() {
        let poller = NoopNetPoller;
        assert!(poller.poll_nonblocking().is_empty());
    }

    #[test]
    fn blocking_gate_admits_only_one_holder() {
        let gate = BlockingPollGate::new();
        assert!(gate.try_acquire(1));
        assert!(!gate.try_acquire(2));
        gate.release(1);
        assert!(gate.try_acquire(2));
    }
}
