//! Caller-facing errors (spec §7.2) and the process-ending diagnostic paths
//! (spec §7.1, §7.3, §7.5).
//!
//! The `thiserror`-derived [`RuntimeError`] mirrors the hand-rolled
//! `Display`/`Error` pairs the teacher uses in `mailbox.rs`
//! (`MailboxSendError`/`MailboxRecvError`), but uses `derive(thiserror::Error)`
//! since `thiserror` is already a teacher workspace dependency. Fatal
//! invariant breaches and deadlock are not representable as `Result` — per
//! spec §7 they end the process — so they go through [`FatalHook`] /
//! [`DeadlockHook`] instead, which default to the
//! `eprintln!` + abort convention established in `panic_boundary.rs`
//! (`"[lumen-runtime] caught panic: {}"`) but are swappable so tests can
//! observe the diagnostic without tearing down the test process.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

/// Errors returned to the caller of a fallible scheduler entry point.
///
/// These are the only two operations in the spec that fail back to the
/// caller rather than ending the process (§7.2, §7.5).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Spawn's argument bytes exceed `Config::max_spawn_args()` (spec §4.2).
    #[error("spawn arguments ({size} bytes) exceed the stack reserve ({max} bytes)")]
    SpawnArgsTooLarge { size: usize, max: usize },

    /// Foreign-thread adoption could not allocate a worker record (spec §4.9).
    #[error("foreign-thread adoption failed: {reason}")]
    AdoptionFailed { reason: String },
}

/// Why the deadlock detector (spec §4.8) decided to end the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockKind {
    /// No task is Waiting — genuine deadlock.
    AllBlocked,
    /// Every task is Waiting — distinguished per spec §4.8's "also exit —
    /// but with a distinct diagnostic".
    AllAsleep,
}

impl fmt::Display for DeadlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlockKind::AllBlocked => write!(f, "all tasks are blocked - deadlock"),
            DeadlockKind::AllAsleep => write!(f, "all tasks are asleep - deadlock"),
        }
    }
}

/// A fatal invariant breach (spec §7.1): a slot or worker observed in a
/// state the scheduler's own invariants forbid.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub message: String,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.message)
    }
}

impl std::error::Error for FatalError {}

/// Hook invoked on a fatal invariant breach. Defaults to printing the
/// diagnostic to stderr and aborting the process; tests install a
/// capturing hook instead (see `set_fatal_hook`).
pub type FatalHook = Box<dyn Fn(&FatalError) + Send + Sync>;

/// Hook invoked by the deadlock detector (spec §4.8). Defaults to printing
/// the diagnostic to stderr and aborting the process.
pub type DeadlockHook = Box<dyn Fn(DeadlockKind) + Send + Sync>;

fn fatal_hook_cell() -> &'static Mutex<FatalHook> {
    static CELL: OnceLock<Mutex<FatalHook>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(Box::new(default_fatal_hook)))
}

fn deadlock_hook_cell() -> &'static Mutex<DeadlockHook> {
    static CELL: OnceLock<Mutex<DeadlockHook>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(Box::new(default_deadlock_hook)))
}

/// Tracks whether a hook has been overridden, purely so tests can assert a
/// fatal/deadlock path fired without the process actually aborting.
static FATAL_FIRED: AtomicBool = AtomicBool::new(false);
static DEADLOCK_FIRED: AtomicBool = AtomicBool::new(false);

fn default_fatal_hook(err: &FatalError) {
    eprintln!("[taskrt] {}", err);
    std::process::abort();
}

fn default_deadlock_hook(kind: DeadlockKind) {
    eprintln!("[taskrt] {}", kind);
    std::process::abort();
}

/// Install a replacement for the fatal-invariant-breach hook. Intended for
/// tests that want to observe a breach without aborting the harness.
pub fn set_fatal_hook(hook: FatalHook) {
    *fatal_hook_cell().lock().unwrap() = hook;
}

/// Install a replacement for the deadlock-detector hook. Intended for
/// tests that want to observe a deadlock without aborting the harness.
pub fn set_deadlock_hook(hook: DeadlockHook) {
    *deadlock_hook_cell().lock().unwrap() = hook;
}

/// Invoke the current fatal hook. Never returns under the default hook.
pub(crate) fn fatal(message: impl Into<String>) -> ! {
    let err = FatalError {
        message: message.into(),
    };
    FATAL_FIRED.store(true, Ordering::SeqCst);
    (fatal_hook_cell().lock().unwrap())(&err);
    // A replacement test hook may choose not to abort; callers of `fatal`
    // are in a state the scheduler's invariants say must not continue, so
    // we still have to stop unwinding normally here.
    std::panic::resume_unwind(Box::new(err));
}

/// Invoke the current deadlock hook. Never returns under the default hook.
pub(crate) fn deadlock(kind: DeadlockKind) -> ! {
    DEADLOCK_FIRED.store(true, Ordering::SeqCst);
    (deadlock_hook_cell().lock().unwrap())(kind);
    std::panic::resume_unwind(Box::new(kind));
}
