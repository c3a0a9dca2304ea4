//! Task representation: status, descriptive stack bookkeeping, and the
//! step-polled body (spec §3, §7.4; see `DESIGN.md` Open Question #3).
//!
//! Grounded on `process.rs::ProcessControlBlock`/`ProcessStatus` for the
//! status machine and mailbox-adjacent fields, `scheduler.rs::Task` for the
//! boxed-closure body shape, `panic_boundary.rs` for the catch/recover
//! convention, and `examples/JonasKruckenberg-k23/libs/async-exec/src/scheduler.rs`'s
//! `PollResult`/`Tick` pattern for the suspend-without-a-real-stack model.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::id::TaskId;

/// A task's place in the scheduling state machine (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Allocated but not yet runnable (sitting in a free cache, or between
    /// `spawn` and its first enqueue).
    Idle,
    /// Enqueued on a local ring or the global queue, waiting for a worker.
    Runnable,
    /// Currently executing on a worker.
    Running,
    /// Parked for a blocking syscall (spec §4.4).
    Syscall,
    /// Parked on a synchronization primitive or timer (spec §4.6/§6).
    Waiting,
    /// Finished — either by returning or by an unrecovered panic.
    Dead,
}

/// Descriptive stack bookkeeping (spec §3's "its own stack region"). No
/// region is actually allocated or switched to; see `DESIGN.md` Open
/// Question #3. Fields exist so callers (and the collector's root-scan
/// simulation, `gc.rs`) have something to report on.
#[derive(Debug, Clone, Copy)]
pub struct Stack {
    pub base: usize,
    pub top: usize,
    pub guard: usize,
}

impl Stack {
    /// A nominal stack description sized from `Config::min_stack_size`,
    /// with no backing allocation.
    pub fn nominal(min_stack_size: usize, ordinal: u64) -> Self {
        let base = ordinal.wrapping_mul(min_stack_size as u64) as usize;
        Self {
            base,
            top: base + min_stack_size,
            guard: base,
        }
    }

    pub fn size(&self) -> usize {
        self.top - self.base
    }
}

/// Run once before a task is re-parked (spec §4.6: "a task may register a
/// callback to run once it is safely parked" — e.g. to release a lock that
/// must stay held until the parking is visible to other workers).
pub type PreParkFn = Box<dyn FnOnce() + Send>;

/// What a single step of a task's body did.
pub enum TaskStep {
    /// The task has no more work; it should transition to `Dead`.
    Complete,
    /// The task ran out its slice voluntarily and should be re-enqueued
    /// (spec §4.3's cooperative yield safe point).
    Yield,
    /// The task is parking and should not be re-enqueued until something
    /// external wakes it. The given callback runs after the task's status
    /// is durably recorded as parked.
    Park(PreParkFn),
}

/// A task's executable body: a step function polled repeatedly by a
/// worker, matching `scheduler.rs::Task::run`'s boxed-closure shape but
/// generalized to return control instead of running to completion.
pub type TaskBody = Box<dyn FnMut() -> TaskStep + Send>;

/// A single registered cleanup (spec §7.4's deferred cleanup on panic,
/// mirroring a `defer`-like mechanism). Cleanups run LIFO.
pub type Cleanup = Box<dyn FnOnce(&PanicCtx) + Send>;

/// The context visible to a cleanup running during unwind (spec §7.4).
/// Grounded on `panic_boundary.rs::PanicError`, generalized to expose a
/// `recover` gate since deferred cleanups — not just an outer boundary —
/// are what's allowed to swallow the panic here.
pub struct PanicCtx {
    message: Option<String>,
    recovered: Cell<bool>,
}

impl PanicCtx {
    fn none() -> Self {
        Self {
            message: None,
            recovered: Cell::new(false),
        }
    }

    fn panicking(message: String) -> Self {
        Self {
            message: Some(message),
            recovered: Cell::new(false),
        }
    }

    /// Whether the task is currently unwinding from a panic.
    pub fn is_panicking(&self) -> bool {
        self.message.is_some()
    }

    /// The panic's message, if any (via `PanicError::from_payload`'s
    /// downcast convention: `&str`/`String`, else "unknown panic payload").
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Swallow the panic: the task continues running instead of dying.
    /// Has no effect when called outside of an active panic.
    pub fn recover(&self) {
        if self.is_panicking() {
            self.recovered.set(true);
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Reported to the runtime when a task dies from an unrecovered panic
/// (spec §7.4).
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub task: TaskId,
    pub message: String,
}

impl fmt::Display for PanicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} panicked: {}", self.task, self.message)
    }
}

/// The result of a single `Task::poll` call, consumed by the worker loop
/// (spec §4.3).
pub enum PollOutcome {
    Complete,
    Yield,
    Park(PreParkFn),
    Panicked(PanicReport),
}

struct TaskInner {
    status: TaskStatus,
    wait_reason: Option<&'static str>,
    cleanups: Vec<Cleanup>,
    body: Option<TaskBody>,
}

/// A schedulable unit of work (spec §3).
///
/// Reused across spawns via the free-task cache (`cache.rs`): `id` and
/// `stack` are fixed at allocation time, while `inner` is reset on reuse.
pub struct Task {
    /// Reassigned on every reuse from the free-task cache: ids are never
    /// reused even though the backing allocation is (spec §3, `id.rs`'s
    /// doc comment, spec §8's "Spawn-then-drain" uniqueness property).
    id: AtomicU64,
    /// Background tasks (spec §4.8) are excluded from the deadlock
    /// detector's "any task runnable or waiting" accounting. An atomic
    /// rather than a fixed field because a recycled task (`reset`) may be
    /// reused for a body with a different background-ness than its
    /// previous occupant.
    background: AtomicBool,
    stack: Stack,
    inner: Mutex<TaskInner>,
}

impl Task {
    pub fn new(id: TaskId, stack: Stack, background: bool, body: TaskBody) -> Self {
        Self {
            id: AtomicU64::new(id.as_u64()),
            background: AtomicBool::new(background),
            stack,
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Idle,
                wait_reason: None,
                cleanups: Vec::new(),
                body: Some(body),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        TaskId::from_raw(self.id.load(Ordering::Acquire))
    }

    /// Assign a fresh id to a recycled task (spec §3: ids are never reused
    /// even though the backing allocation is).
    pub fn set_id(&self, id: TaskId) {
        self.id.store(id.as_u64(), Ordering::Release);
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::Acquire)
    }

    pub fn set_background(&self, background: bool) {
        self.background.store(background, Ordering::Release);
    }

    pub fn stack(&self) -> Stack {
        self.stack
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().unwrap().status
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.inner.lock().unwrap().status = status;
    }

    pub fn wait_reason(&self) -> Option<&'static str> {
        self.inner.lock().unwrap().wait_reason
    }

    pub fn set_wait_reason(&self, reason: Option<&'static str>) {
        self.inner.lock().unwrap().wait_reason = reason;
    }

    /// Register a cleanup to run (LIFO) the next time this task's body
    /// finishes stepping, whether by completion, yield, park, or panic.
    pub fn defer(&self, cleanup: Cleanup) {
        self.inner.lock().unwrap().cleanups.push(cleanup);
    }

    /// Replace this task's body, for reuse from the free-task cache
    /// (spec §4.1). Resets status to `Idle`, drops any leftover cleanups
    /// from the previous occupant, and re-tags background-ness for the
    /// new occupant.
    pub fn reset(&self, id: TaskId, background: bool, body: TaskBody) {
        self.set_id(id);
        self.set_background(background);
        let mut inner = self.inner.lock().unwrap();
        inner.status = TaskStatus::Idle;
        inner.wait_reason = None;
        inner.cleanups.clear();
        inner.body = Some(body);
    }

    /// Run one step of this task's body, catching panics at the boundary
    /// (spec §7.4) and running deferred cleanups LIFO afterward. A cleanup
    /// may call [`PanicCtx::recover`] to swallow a panic; if none does, the
    /// panic is reported to the caller as a [`PanicReport`] and this task's
    /// status becomes `Dead`.
    pub fn poll(&self) -> PollOutcome {
        let mut inner = self.inner.lock().unwrap();
        let mut body = match inner.body.take() {
            Some(b) => b,
            None => return PollOutcome::Complete,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| body()));

        let (step, ctx) = match result {
            Ok(step) => (Some(step), PanicCtx::none()),
            Err(payload) => (None, PanicCtx::panicking(panic_message(payload))),
        };

        let cleanups = std::mem::take(&mut inner.cleanups);
        for cleanup in cleanups.into_iter().rev() {
            cleanup(&ctx);
        }

        if ctx.is_panicking() && !ctx.recovered.get() {
            inner.status = TaskStatus::Dead;
            return PollOutcome::Panicked(PanicReport {
                task: self.id(),
                message: ctx.message.unwrap(),
            });
        }

        match step {
            Some(TaskStep::Complete) => {
                inner.status = TaskStatus::Dead;
                PollOutcome::Complete
            }
            Some(TaskStep::Yield) => {
                inner.body = Some(body);
                PollOutcome::Yield
            }
            Some(TaskStep::Park(pre_park)) => {
                inner.body = Some(body);
                PollOutcome::Park(pre_park)
            }
            // The body panicked and a cleanup recovered it: treat the step
            // as a yield so the task is rescheduled rather than dropped.
            None => {
                inner.body = Some(body);
                PollOutcome::Yield
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("background", &self.is_background())
            .field("status", &inner.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_id() -> TaskId {
        crate::id::TaskIdGen::new().next()
    }

    #[test]
    fn completes_on_first_poll() {
        let t = Task::new(test_id(), Stack::nominal(4096, 0), false, Box::new(|| TaskStep::Complete));
        assert!(matches!(t.poll(), PollOutcome::Complete));
        assert_eq!(t.status(), TaskStatus::Dead);
    }

    #[test]
    fn yields_then_completes() {
        let mut calls = 0;
        let t = Task::new(
            test_id(),
            Stack::nominal(4096, 0),
            false,
            Box::new(move || {
                calls += 1;
                if calls < 3 {
                    TaskStep::Yield
                } else {
                    TaskStep::Complete
                }
            }),
        );
        assert!(matches!(t.poll(), PollOutcome::Yield));
        assert!(matches!(t.poll(), PollOutcome::Yield));
        assert!(matches!(t.poll(), PollOutcome::Complete));
    }

    #[test]
    fn park_returns_prepark_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let t = Task::new(
            test_id(),
            Stack::nominal(4096, 0),
            false,
            Box::new(move || {
                let fired3 = Arc::clone(&fired2);
                TaskStep::Park(Box::new(move || {
                    fired3.fetch_add(1, Ordering::SeqCst);
                }))
            }),
        );
        match t.poll() {
            PollOutcome::Park(pre_park) => pre_park(),
            _ => panic!("expected Park"),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_without_recover_dies_and_reports() {
        let t = Task::new(
            test_id(),
            Stack::nominal(4096, 0),
            false,
            Box::new(|| panic!("boom")),
        );
        match t.poll() {
            PollOutcome::Panicked(report) => assert_eq!(report.message, "boom"),
            _ => panic!("expected Panicked"),
        }
        assert_eq!(t.status(), TaskStatus::Dead);
    }

    #[test]
    fn panic_with_recover_continues_as_yield() {
        let t = Task::new(test_id(), Stack::nominal(4096, 0), false, Box::new(|| panic!("boom")));
        t.defer(Box::new(|ctx| {
            if ctx.is_panicking() {
                ctx.recover();
            }
        }));
        assert!(matches!(t.poll(), PollOutcome::Yield));
        assert_ne!(t.status(), TaskStatus::Dead);
    }

    #[test]
    fn cleanups_run_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let t = Task::new(test_id(), Stack::nominal(4096, 0), false, Box::new(|| TaskStep::Complete));
        for i in 0..3 {
            let order = Arc::clone(&order);
            t.defer(Box::new(move |_ctx| order.lock().unwrap().push(i)));
        }
        t.poll();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn reset_clears_status_and_leftover_cleanups() {
        let t = Task::new(test_id(), Stack::nominal(4096, 0), false, Box::new(|| TaskStep::Yield));
        t.poll();
        t.defer(Box::new(|_| {}));
        let new_id = test_id();
        t.reset(new_id, true, Box::new(|| TaskStep::Complete));
        assert_eq!(t.status(), TaskStatus::Idle);
        assert!(t.is_background());
        assert_eq!(t.id(), new_id);
        assert!(matches!(t.poll(), PollOutcome::Complete));
    }
}
