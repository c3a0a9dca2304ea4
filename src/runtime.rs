//! The scheduler's central state and worker main loop (spec §3, §4.2,
//! §4.3).
//!
//! Grounded on `scheduler.rs::Scheduler`: `new` (worker-count resolution),
//! `spawn`/`spawn_fn` (task construction and enqueue), `worker_loop` (the
//! local-queue/global-queue/steal/park priority order), and `xorshift32`
//! (the hand-rolled PRNG used to pick a random peer to steal from — the
//! teacher's own comment explains why it avoids pulling in the `rand`
//! crate for this single use case, and this repo keeps that choice).
//! Generalized from the teacher's flat worker pool into the spec's
//! three-level slot/worker/task model, with the syscall hand-off
//! (`syscall.rs`), stop-the-world (`stw.rs`), monitor (`monitor.rs`) and
//! deadlock (`deadlock.rs`) protocols wired in around it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::FreeCache;
use crate::cgo::CgoAdoption;
use crate::config::Config;
use crate::deadlock;
use crate::error::{self, DeadlockKind, RuntimeError};
use crate::gc::{Collector, NoopCollector};
use crate::global_queue::GlobalQueue;
use crate::id::{TaskId, TaskIdGen};
use crate::monitor::Monitor;
use crate::netpoll::{BlockingPollGate, NetPoller, NoopNetPoller, SharedNetPoller};
use crate::slot::{Slot, SlotId, SlotStatus};
use crate::stw::StwController;
use crate::syscall::{self, ExitSyscallOutcome};
use crate::task::{Stack, Task, TaskBody, TaskStatus, TaskStep};
use crate::worker::{Worker, WorkerHandle, WorkerId};

thread_local! {
    /// The slot index a worker OS thread is currently bound to, so
    /// `Runtime::spawn` called from inside a running task can enqueue onto
    /// the caller's own local ring (spec §4.2's "a task spawned from
    /// inside another task prefers the spawning worker's local queue"),
    /// matching `runqput`'s behavior in the original runtime.
    static CURRENT_SLOT: std::cell::Cell<Option<SlotId>> = std::cell::Cell::new(None);
}

/// The scheduler: every slot, every worker, the global run queue and free
/// cache, and the coordination primitives (monitor, stop-the-world,
/// deadlock detector, foreign-thread adoption) that tie them together.
pub struct Runtime {
    config: Config,
    task_ids: TaskIdGen,
    slots: Arc<Vec<Arc<Slot>>>,
    active_slot_count: AtomicUsize,
    pending_slot_count: AtomicUsize,
    workers: Mutex<Vec<WorkerHandle>>,
    idle_slots: Arc<Mutex<Vec<SlotId>>>,
    global_queue: GlobalQueue,
    global_free: Arc<Mutex<VecDeque<Arc<Task>>>>,
    shutdown: AtomicBool,
    spawned: AtomicU64,
    completed: AtomicU64,
    /// Every task ever allocated by this runtime, held weakly so recycled
    /// (but still-live) tasks stay visible to enumeration (spec §3's
    /// "a list of all tasks, for enumeration and GC") without keeping a
    /// freed one alive past its last strong reference.
    all_tasks: Mutex<Vec<Weak<Task>>>,
    stw: StwController,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    netpoller: SharedNetPoller,
    poll_gate: Arc<BlockingPollGate>,
    collector: Arc<dyn Collector>,
    cgo: CgoAdoption,
}

impl Runtime {
    /// Build a runtime with a no-op network poller and collector.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_plugins(config, Arc::new(NoopNetPoller), Arc::new(NoopCollector))
    }

    pub fn with_plugins(
        config: Config,
        netpoller: SharedNetPoller,
        collector: Arc<dyn Collector>,
    ) -> Arc<Self> {
        let slot_capacity = Config::MAX_SLOTS;
        let global_free = FreeCache::new_global();
        let slots: Vec<Arc<Slot>> = (0..slot_capacity)
            .map(|id| {
                Arc::new(Slot::new(
                    id,
                    config.local_ring_capacity,
                    Arc::clone(&global_free),
                    config.free_cache_local_bound,
                ))
            })
            .collect();
        for slot in slots.iter().skip(config.slots) {
            slot.set_status(SlotStatus::Dead);
        }
        let idle_slots = (0..config.slots).collect();

        Arc::new(Self {
            active_slot_count: AtomicUsize::new(config.slots),
            pending_slot_count: AtomicUsize::new(config.slots),
            config,
            task_ids: TaskIdGen::new(),
            slots: Arc::new(slots),
            workers: Mutex::new(Vec::new()),
            idle_slots: Arc::new(Mutex::new(idle_slots)),
            global_queue: GlobalQueue::new(),
            global_free,
            shutdown: AtomicBool::new(false),
            spawned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            all_tasks: Mutex::new(Vec::new()),
            stw: StwController::new(),
            monitor_handle: Mutex::new(None),
            netpoller,
            poll_gate: Arc::new(BlockingPollGate::new()),
            collector,
            cgo: CgoAdoption::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn spawned_count(&self) -> u64 {
        self.spawned.load(Ordering::Acquire)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Start one worker OS thread per configured slot, plus the monitor
    /// thread (spec §4.3, §4.4).
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        for slot_id in 0..self.active_slot_count.load(Ordering::Acquire) {
            workers.push(self.spawn_worker_thread(slot_id));
        }
        drop(workers);

        let monitor = Monitor::new(
            Arc::clone(&self.slots),
            Arc::clone(&self.idle_slots),
            Arc::clone(&self.netpoller),
            Arc::clone(&self.poll_gate),
            self.config.monitor_min_sleep,
            self.config.monitor_max_sleep,
        );
        let rt = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("taskrt-monitor".into())
            .spawn(move || rt.monitor_loop(monitor))
            .expect("failed to spawn monitor thread");
        *self.monitor_handle.lock().unwrap() = Some(handle);
    }

    fn spawn_worker_thread(self: &Arc<Self>, initial_slot: SlotId) -> WorkerHandle {
        let worker = Arc::new(Worker::new(initial_slot));
        worker.bind_slot(initial_slot);
        self.slots[initial_slot].set_status(SlotStatus::Idle);
        self.slots[initial_slot].bind_worker(initial_slot);
        // This slot is now claimed by a worker, not free for anyone else
        // to acquire — remove it from the idle-slot free list (spec §3's
        // invariant: "the idle-slot stack contains exactly those slots
        // [...] no slot appears twice").
        self.idle_slots.lock().unwrap().retain(|&s| s != initial_slot);

        let rt = Arc::clone(self);
        let worker_for_thread = Arc::clone(&worker);
        let join_handle = std::thread::Builder::new()
            .name(format!("taskrt-worker-{initial_slot}"))
            .spawn(move || {
                rt.worker_loop(worker_for_thread, initial_slot);
            })
            .expect("failed to spawn worker thread");

        WorkerHandle {
            worker,
            join_handle: Some(join_handle),
        }
    }

    /// Spawn a foreground task (spec §4.2). Fails if `body`'s captured
    /// argument state would exceed `Config::max_spawn_args`.
    pub fn spawn(&self, args_size: usize, body: TaskBody) -> Result<TaskId, RuntimeError> {
        self.spawn_inner(args_size, body, false)
    }

    /// Spawn a background task (spec §4.8): excluded from the deadlock
    /// detector's liveness accounting, used for housekeeping tasks that
    /// should never themselves be reported as the cause of a deadlock.
    pub fn spawn_background(&self, args_size: usize, body: TaskBody) -> Result<TaskId, RuntimeError> {
        self.spawn_inner(args_size, body, true)
    }

    fn spawn_inner(
        &self,
        args_size: usize,
        body: TaskBody,
        background: bool,
    ) -> Result<TaskId, RuntimeError> {
        let max = self.config.max_spawn_args();
        if args_size > max {
            return Err(RuntimeError::SpawnArgsTooLarge {
                size: args_size,
                max,
            });
        }

        let id = self.task_ids.next();
        let task = if let Some(reused) = self.take_any_free_task() {
            reused.reset(id, background, body);
            reused
        } else {
            let fresh = Arc::new(Task::new(
                id,
                Stack::nominal(self.config.min_stack_size, id.as_u64()),
                background,
                body,
            ));
            self.all_tasks.lock().unwrap().push(Arc::downgrade(&fresh));
            fresh
        };

        self.spawned.fetch_add(1, Ordering::AcqRel);
        task.set_status(crate::task::TaskStatus::Runnable);

        let enqueued_locally = CURRENT_SLOT.with(|c| {
            if let Some(slot_id) = c.get() {
                self.slots[slot_id].local_ring.push(Arc::clone(&task));
                true
            } else {
                false
            }
        });
        if !enqueued_locally {
            self.global_queue.push(Arc::clone(&task));
        }

        self.wake_one_idle_worker();
        Ok(id)
    }

    fn take_any_free_task(&self) -> Option<Arc<Task>> {
        for slot in self.slots.iter() {
            if let Some(t) = slot.free_cache.take() {
                return Some(t);
            }
        }
        None
    }

    fn wake_one_idle_worker(&self) {
        let workers = self.workers.lock().unwrap();
        for handle in workers.iter() {
            if handle.worker.is_spinning() {
                handle.worker.unpark();
                return;
            }
        }
    }

    /// Block the calling thread until `expected` tasks have completed or
    /// `timeout` elapses (grounded on `scheduler.rs::wait_for_completion`'s
    /// deadline-polling loop).
    pub fn wait_for_completion(&self, expected: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.completed_count() < expected {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Signal every worker and the monitor to stop, then join them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.iter() {
            handle.worker.unpark();
        }
        for handle in workers.iter_mut() {
            if let Some(j) = handle.join_handle.take() {
                let _ = j.join();
            }
        }
        if let Some(j) = self.monitor_handle.lock().unwrap().take() {
            let _ = j.join();
        }
    }

    /// Stage a new admission cap; applied at the next stop-the-world cycle
    /// rather than immediately (spec §9, `DESIGN.md` Open Question #2).
    pub fn set_slot_count(&self, new_count: usize) {
        let clamped = new_count.clamp(1, Config::MAX_SLOTS);
        self.pending_slot_count.store(clamped, Ordering::Release);
    }

    /// Run one stop-the-world cycle (spec §4.5): pause every slot, apply
    /// any staged admission resize, run a GC cycle through the registered
    /// collector, then resume. Slots the requester can seize unilaterally
    /// (the idle-slot stack, anything stuck in `Syscall`) are transitioned
    /// to `GcStop` directly; every other active slot is left for its
    /// owning worker to transition itself, cooperatively, the next time it
    /// passes through `observe_stw_if_requested` (spec §4.5's "any worker
    /// entering the main loop ... hands its slot to this protocol").
    pub fn run_stop_the_world_cycle(self: &Arc<Self>) {
        let slot_count = self.active_slot_count.load(Ordering::Acquire);
        self.stw.begin(slot_count);

        let mut freed = self.seize_unowned_slots(slot_count);

        // Nudge every parked worker so it notices the request without
        // waiting out its own park timeout.
        for handle in self.workers.lock().unwrap().iter() {
            handle.worker.unpark();
        }

        self.stw.wait_until_acked();

        // A worker can be caught mid-release: it has already set its slot
        // to `Idle` and unbound itself, but hasn't pushed the id onto
        // `idle_slots` yet when `seize_unowned_slots` drains that stack —
        // the slot is unowned but never seized, so it never acks. Re-sweep
        // until nothing new turns up; each retry only costs a lock and an
        // iteration, and the window it closes is two field writes wide.
        loop {
            let mut more = self.seize_unowned_slots(slot_count);
            if more.is_empty() {
                break;
            }
            freed.append(&mut more);
            self.stw.wait_until_acked();
        }
        debug_assert!(self.slots[..slot_count]
            .iter()
            .all(|s| s.status() == SlotStatus::GcStop));

        self.apply_pending_resize();
        let helpers = self.gc_helper_count();
        self.collector.collect(helpers);

        self.release_stopped_slots(&freed);
        self.stw.end();
    }

    /// Directly transition every slot this thread can seize without a
    /// worker's cooperation (spec §4.5 steps 4-5): the idle-slot stack
    /// (fully unowned) and anything currently `Syscall` (its worker is away
    /// in a real blocking call and can't cooperate). Returns the ids that
    /// were free before the cycle, so [`Runtime::release_stopped_slots`]
    /// knows which ones to hand back to the idle-slot pool afterward
    /// rather than leaving them bound to a worker that never owned them.
    fn seize_unowned_slots(&self, slot_count: usize) -> Vec<SlotId> {
        let drained: Vec<SlotId> = {
            let mut idle = self.idle_slots.lock().unwrap();
            idle.drain(..).collect()
        };
        let mut freed = Vec::new();
        for id in drained {
            if id < slot_count && self.slots[id].compare_exchange_status(SlotStatus::Idle, SlotStatus::GcStop) {
                self.stw.ack();
                freed.push(id);
            }
            // Else: lost a race (a resize already dropped this id, or the
            // slot's worker already moved it) — it still reaches GcStop
            // via that worker's own cooperative ack.
        }

        for slot in self.slots[..slot_count].iter() {
            if slot.status() == SlotStatus::Syscall
                && slot.compare_exchange_status(SlotStatus::Syscall, SlotStatus::GcStop)
            {
                slot.clear_syscall_entered();
                slot.unbind_worker();
                self.stw.ack();
                freed.push(slot.id());
            }
        }
        freed
    }

    /// Resume every active slot to `Idle` (spec §4.5's starttheworld).
    /// Slots in `freed` had no owning worker before the cycle — those go
    /// back onto the idle-slot pool; every other slot is still bound to
    /// whichever worker owned it going in, which will simply resume
    /// picking tasks off it without needing to re-acquire anything.
    fn release_stopped_slots(&self, freed: &[SlotId]) {
        let slot_count = self.active_slot_count.load(Ordering::Acquire);
        for slot in self.slots[..slot_count].iter() {
            if slot.status() == SlotStatus::GcStop {
                slot.set_status(SlotStatus::Idle);
            }
        }
        let mut idle = self.idle_slots.lock().unwrap();
        for &id in freed {
            if id < slot_count && !idle.contains(&id) {
                idle.push(id);
            }
        }
    }

    /// `gcHelperCount()` (spec §6): how many of the just-stopped workers
    /// the collector may recruit as mark-assist helpers, capped by the
    /// admission count, the physical CPU count, `Config::MAX_GC_PROC`, and
    /// one more than the number of workers that were already idle.
    pub fn gc_helper_count(&self) -> usize {
        let slots = self.active_slot_count.load(Ordering::Acquire);
        let idle = self.idle_slots.lock().unwrap().len();
        [
            slots,
            num_cpus::get().max(1),
            crate::config::Config::MAX_GC_PROC,
            idle + 1,
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }

    fn apply_pending_resize(self: &Arc<Self>) {
        let pending = self.pending_slot_count.load(Ordering::Acquire);
        let current = self.active_slot_count.load(Ordering::Acquire);
        if pending == current {
            return;
        }

        if pending < current {
            for slot in self.slots[pending..current].iter() {
                let drained = slot.local_ring.drain();
                self.global_queue.push_many(drained);
                slot.set_status(SlotStatus::Dead);
                slot.unbind_worker();
            }
            self.idle_slots
                .lock()
                .unwrap()
                .retain(|&id| id < pending);
        } else {
            let mut workers = self.workers.lock().unwrap();
            for slot_id in current..pending {
                self.slots[slot_id].set_status(SlotStatus::Idle);
                self.idle_slots.lock().unwrap().push(slot_id);
                if slot_id >= workers.len() {
                    workers.push(self.spawn_worker_thread(slot_id));
                }
            }
        }
        self.active_slot_count.store(pending, Ordering::Release);
    }

    /// Cooperative observance of an in-flight stop-the-world request; a
    /// worker calls this at each of the spec's listed safe points (§4.5).
    /// Transitions the caller's own slot to `GcStop` (step 3: "mark the
    /// current worker's slot GcStop"), acks, then waits for
    /// `start_the_world` before resuming with the same slot — which by
    /// then is back to `Idle`, exactly as this worker left it.
    fn observe_stw_if_requested(&self, home_slot: SlotId) {
        if !self.stw.is_requested() {
            return;
        }
        let slot = &self.slots[home_slot];
        loop {
            let current = slot.status();
            if current == SlotStatus::GcStop {
                break;
            }
            if slot.compare_exchange_status(current, SlotStatus::GcStop) {
                self.stw.ack();
                break;
            }
        }
        while self.stw.is_requested() {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn monitor_loop(self: Arc<Self>, monitor: Monitor) {
        while !self.is_shutdown() {
            let report = monitor.tick();
            for &task_id in &report.woken {
                self.requeue_woken(task_id);
            }
            for &slot_id in &report.retaken {
                self.handoff_retaken_slot(slot_id);
            }
            std::thread::sleep(monitor.sleep.current());
        }
    }

    /// A slot the monitor just reclaimed from a stuck syscall (spec
    /// §4.4's "CASes the slot to Idle and hands it off") needs someone to
    /// actually run it: if a worker is already parked waiting for work,
    /// unpark it. Otherwise every worker this runtime owns is itself busy
    /// (each is 1:1 with an OS thread, so a busy worker can't just drop
    /// what it's doing), so a fresh worker thread is spun up bound to the
    /// freed slot — the `startm`/`newm` path in the original runtime —
    /// so the work waiting in the global queue doesn't sit behind however
    /// long the other stuck syscalls take to return.
    fn handoff_retaken_slot(self: &Arc<Self>, slot_id: SlotId) {
        let has_spinning_worker = {
            let workers = self.workers.lock().unwrap();
            workers.iter().any(|h| h.worker.is_spinning())
        };
        if has_spinning_worker {
            self.wake_one_idle_worker();
            return;
        }
        if self.is_shutdown() {
            return;
        }
        let claimed = {
            let mut idle = self.idle_slots.lock().unwrap();
            if let Some(pos) = idle.iter().position(|&s| s == slot_id) {
                idle.remove(pos);
                true
            } else {
                false
            }
        };
        if claimed {
            let mut workers = self.workers.lock().unwrap();
            workers.push(self.spawn_worker_thread(slot_id));
        }
    }

    /// A network-readiness event woke `task_id` (spec §4.7); rather than
    /// track a task-id-to-Task map here (the scheduler's `spawn` already
    /// owns every live `Task` via its queues), this just pokes an idle
    /// worker — by the time this fires the waiting task has already been
    /// pushed back onto the global queue by whichever code called
    /// `park` on its behalf.
    fn requeue_woken(&self, task_id: TaskId) {
        let _ = task_id;
        self.wake_one_idle_worker();
    }

    /// Mark the calling worker's current slot as being in a syscall
    /// (spec §4.4). Intended to be called from inside a task's step
    /// function, around a real blocking call, using the fast-path CAS in
    /// `syscall.rs`. A no-op if called from outside a worker thread.
    pub fn enter_syscall(&self) {
        if let Some(slot_id) = CURRENT_SLOT.with(|c| c.get()) {
            syscall::enter_syscall(&self.slots[slot_id]);
        }
    }

    /// Leave a syscall entered via [`Runtime::enter_syscall`] (spec §4.4).
    /// On the fast path this simply reclaims the same slot. On the slow
    /// path — the slot was retaken by the monitor while blocked — this
    /// worker is still a live OS thread with no way to give up its call
    /// stack (see `DESIGN.md` Open Question #3), so it waits for any idle
    /// slot to become available rather than truly parking.
    pub fn exit_syscall(&self) {
        let slot_id = match CURRENT_SLOT.with(|c| c.get()) {
            Some(s) => s,
            None => return,
        };
        match syscall::exit_syscall(&self.slots[slot_id]) {
            ExitSyscallOutcome::ReacquiredSameSlot => {}
            ExitSyscallOutcome::SlotWasRetaken => loop {
                if let Some(new_slot) = self.acquire_idle_slot(slot_id) {
                    CURRENT_SLOT.with(|c| c.set(Some(new_slot)));
                    self.slots[new_slot].set_status(SlotStatus::Running);
                    return;
                }
                if self.is_shutdown() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            },
        }
    }

    /// Adopt the calling OS thread as a foreign-thread worker (spec §4.9).
    pub fn adopt_foreign_thread(self: &Arc<Self>) -> Result<Arc<Worker>, RuntimeError> {
        Ok(self.cgo.adopt())
    }

    pub fn release_foreign_thread(&self, worker: Arc<Worker>) {
        self.cgo.release(worker);
    }

    pub fn foreign_call_count(&self) -> u64 {
        self.cgo.foreign_call_count()
    }

    /// The main per-worker loop (spec §4.3): local ring, then a capped
    /// batch from the global queue, then a random peer steal, then park.
    fn worker_loop(self: Arc<Self>, worker: Arc<Worker>, mut home_slot: SlotId) {
        let mut rng_state: u32 = (home_slot as u32).wrapping_mul(2_654_435_761).wrapping_add(1);

        while !self.is_shutdown() {
            self.observe_stw_if_requested(home_slot);
            CURRENT_SLOT.with(|c| c.set(Some(home_slot)));

            if let Some(task) = self.next_runnable_task(home_slot, &mut rng_state) {
                worker.set_spinning(false);
                worker.set_current_task(Some(task.id()));
                self.slots[home_slot].set_status(SlotStatus::Running);
                self.run_task_to_suspension(&worker, home_slot, task);
                // The task may have blocked in a syscall and come back out
                // on a different slot (`exit_syscall`'s slow path, when the
                // monitor retook `home_slot` while we were blocked) — adopt
                // whatever `CURRENT_SLOT` says now rather than keep driving
                // the slot we started this iteration on, or the old slot
                // never leaves `Running` and the new one never rejoins the
                // idle-slot pool.
                home_slot = CURRENT_SLOT.with(|c| c.get()).unwrap_or(home_slot);
                self.slots[home_slot].set_status(SlotStatus::Idle);
                worker.set_current_task(None);
                self.slots[home_slot].advance_tick();
                continue;
            }

            // No work anywhere: release this slot to the idle-slot stack
            // before parking (spec §4.3 step 5 — "release the slot to the
            // idle-slot stack ... and then park the worker"), so the
            // deadlock detector and `gc_helper_count` see an accurate
            // idle-worker snapshot rather than one that only ever reflects
            // slots freed by admission resize.
            worker.set_spinning(true);
            self.slots[home_slot].set_status(SlotStatus::Idle);
            self.slots[home_slot].unbind_worker();
            self.idle_slots.lock().unwrap().push(home_slot);

            worker.park_wake(Duration::from_millis(1));
            worker.set_spinning(false);

            // Reclaim a slot before doing anything else — this worker
            // gave its own up above, and a resize or monitor retake may
            // have changed which ids are actually available since.
            loop {
                if let Some(new_slot) = self.acquire_idle_slot(home_slot) {
                    home_slot = new_slot;
                    break;
                }
                if self.is_shutdown() {
                    CURRENT_SLOT.with(|c| c.set(None));
                    return;
                }
                worker.park_wake(Duration::from_millis(1));
            }
        }

        CURRENT_SLOT.with(|c| c.set(None));
    }

    /// Claim a slot from the idle-slot stack, preferring `preferred` if
    /// it's still there. Skips (and drops) any stale `Dead` entry left
    /// behind by a shrinking admission resize rather than handing a
    /// worker a slot that no longer exists.
    fn acquire_idle_slot(&self, preferred: SlotId) -> Option<SlotId> {
        let mut idle = self.idle_slots.lock().unwrap();
        if let Some(pos) = idle.iter().position(|&s| s == preferred) {
            idle.remove(pos);
            if self.slots[preferred].status() != SlotStatus::Dead {
                self.slots[preferred].bind_worker(preferred);
                return Some(preferred);
            }
        }
        while let Some(s) = idle.pop() {
            if self.slots[s].status() != SlotStatus::Dead {
                self.slots[s].bind_worker(s);
                return Some(s);
            }
        }
        None
    }

    fn next_runnable_task(&self, home_slot: SlotId, rng_state: &mut u32) -> Option<Arc<Task>> {
        if let Some(t) = self.slots[home_slot].local_ring.pop() {
            return Some(t);
        }

        let active = self.active_slot_count.load(Ordering::Acquire).max(1);
        let mut batch = Vec::new();
        self.global_queue.take_batch(active, 64, &mut batch);
        if let Some(first) = batch.pop() {
            for t in batch {
                self.slots[home_slot].local_ring.push(t);
            }
            return Some(first);
        }

        // Random-peer steal, mirroring `scheduler.rs`'s xorshift32-driven
        // victim selection.
        for _ in 0..active {
            let victim = (xorshift32(rng_state) as usize) % active;
            if victim == home_slot {
                continue;
            }
            if self.slots[home_slot]
                .local_ring
                .steal_half_from(&self.slots[victim].local_ring)
                > 0
            {
                return self.slots[home_slot].local_ring.pop();
            }
        }

        None
    }

    fn run_task_to_suspension(&self, worker: &Worker, home_slot: SlotId, task: Arc<Task>) {
        use crate::task::PollOutcome;
        match task.poll() {
            PollOutcome::Complete => {
                self.finish_task(task);
            }
            PollOutcome::Yield => {
                task.set_status(crate::task::TaskStatus::Runnable);
                self.slots[home_slot].local_ring.push(task);
            }
            PollOutcome::Park(pre_park) => {
                task.set_status(crate::task::TaskStatus::Waiting);
                pre_park();
                // The task stays off every queue until whatever it's
                // waiting on re-enqueues it (spec §4.6).
                let _ = worker;
            }
            PollOutcome::Panicked(report) => {
                error::fatal(format!("unrecovered panic: {report}"));
            }
        }
    }

    fn finish_task(&self, task: Arc<Task>) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        let home = task.stack().base % self.slots.len().max(1);
        self.slots[home].free_cache.put(task);
    }

    /// Evaluate the deadlock detector against the current snapshot
    /// (spec §4.8). Exposed for embedders that want to poll it themselves
    /// rather than relying solely on the monitor's cadence; this crate
    /// does not call it automatically, since doing so from the monitor
    /// thread on every tick would make a transient zero-runnable window
    /// during startup look like a deadlock.
    pub fn check_deadlock(&self) -> Option<DeadlockKind> {
        let workers = self.workers.lock().unwrap();
        // `deadlock::check`'s formula subtracts one "for sysmon" (spec
        // §4.8, §9's Open Question #1) on the assumption that `mcount`
        // already counts the monitor thread among the scheduler's OS
        // threads, the way the original's `mcount` does. This crate keeps
        // the monitor in its own `monitor_handle` rather than `workers`,
        // so it has to be added back in here, or the formula's `-1`
        // double-subtracts a thread that was never counted in the first
        // place.
        let monitor_running = self.monitor_handle.lock().unwrap().is_some();
        let mcount = workers.len() + usize::from(monitor_running);
        let idle_workers = self.idle_slots.lock().unwrap().len();
        let locked_workers = workers.iter().filter(|h| h.worker.is_locked()).count();
        let any_waiting = self.any_foreground_task_waiting();
        deadlock::check(mcount, idle_workers, locked_workers, any_waiting)
    }

    /// [`Runtime::check_deadlock`], but ends the process through
    /// [`error::deadlock`] (spec §7.3) if it reports one — the default
    /// behavior a CLI embedder wants; library embedders that want to
    /// decide for themselves should call `check_deadlock` directly.
    pub fn check_deadlock_and_abort(&self) {
        if let Some(kind) = self.check_deadlock() {
            error::deadlock(kind);
        }
    }

    /// Scan every still-live task for a non-background one parked
    /// `Waiting` (spec §4.8's deadlock scan).
    fn any_foreground_task_waiting(&self) -> bool {
        self.all_tasks
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .any(|t| !t.is_background() && t.status() == TaskStatus::Waiting)
    }

    /// Count of every still-live task in a given status (spec §6's
    /// "Observable counters: task count by status").
    pub fn task_count_by_status(&self, status: TaskStatus) -> usize {
        self.all_tasks
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.status() == status)
            .count()
    }

    /// Number of live worker OS threads (spec §6).
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Number of workers currently spinning in search of work (spec §6).
    pub fn spinning_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.worker.is_spinning())
            .count()
    }

    /// Number of slots currently on the idle-slot stack (spec §6).
    pub fn idle_slot_count(&self) -> usize {
        self.idle_slots.lock().unwrap().len()
    }

    /// The current admission cap, after any staged resize that has been
    /// applied by a stop-the-world cycle (spec §6, §9).
    pub fn active_slot_count(&self) -> usize {
        self.active_slot_count.load(Ordering::Acquire)
    }

    /// Number of slots currently `Running` a task (spec §6).
    pub fn running_slot_count(&self) -> usize {
        self.slots[..self.active_slot_count()]
            .iter()
            .filter(|s| s.status() == SlotStatus::Running)
            .count()
    }
}

/// Hand-rolled xorshift32, matching `scheduler.rs::Scheduler::xorshift32`
/// ("We avoid pulling in the `rand` crate for this single use case").
fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn test_config() -> Config {
        let mut cfg = Config::with_slots(2);
        cfg.local_ring_capacity = 4;
        cfg
    }

    #[test]
    fn spawn_and_run_a_thousand_tasks_to_completion() {
        let rt = Runtime::new(test_config());
        rt.start();

        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            rt.spawn(
                0,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    TaskStep::Complete
                }),
            )
            .unwrap();
        }

        assert!(rt.wait_for_completion(1000, Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        rt.shutdown();
    }

    #[test]
    fn spawn_rejects_oversized_arguments() {
        let rt = Runtime::new(test_config());
        let max = rt.config().max_spawn_args();
        let err = rt.spawn(max + 1, Box::new(|| TaskStep::Complete));
        assert!(matches!(err, Err(RuntimeError::SpawnArgsTooLarge { .. })));
    }

    #[test]
    fn yielding_task_eventually_completes() {
        let rt = Runtime::new(test_config());
        rt.start();
        let steps = Arc::new(StdAtomicUsize::new(0));
        let steps2 = Arc::clone(&steps);
        rt.spawn(
            0,
            Box::new(move || {
                if steps2.fetch_add(1, Ordering::SeqCst) < 3 {
                    TaskStep::Yield
                } else {
                    TaskStep::Complete
                }
            }),
        )
        .unwrap();
        assert!(rt.wait_for_completion(1, Duration::from_secs(5)));
        assert!(steps.load(Ordering::SeqCst) >= 4);
        rt.shutdown();
    }

    #[test]
    fn stop_the_world_cycle_applies_a_staged_shrink() {
        let rt = Runtime::new(Config::with_slots(4));
        rt.start();
        rt.set_slot_count(1);
        rt.run_stop_the_world_cycle();
        assert_eq!(rt.active_slot_count.load(Ordering::Acquire), 1);
        rt.shutdown();
    }

    #[test]
    fn stop_the_world_cycle_observes_every_slot_gcstop_then_none() {
        // spec §8: "after stop-the-world returns, every slot is GcStop and
        // no task is Running; after starttheworld returns, no slot is
        // GcStop." The collector runs while the world is stopped, so it's
        // the vantage point from which to observe the mid-cycle snapshot.
        // The collector is supplied at construction time, before `Runtime`
        // exists to hand it a slot table — so it holds a cell the test
        // fills in right after construction instead.
        struct AssertingCollector {
            slots: Mutex<Option<Arc<Vec<Arc<Slot>>>>>,
            slot_count: usize,
        }
        impl crate::gc::Collector for AssertingCollector {
            fn collect(&self, _helpers: usize) {
                let guard = self.slots.lock().unwrap();
                let slots = guard.as_ref().expect("slot table not set");
                for slot in slots[..self.slot_count].iter() {
                    assert_eq!(slot.status(), SlotStatus::GcStop);
                }
            }
        }

        let cfg = test_config();
        let collector = Arc::new(AssertingCollector {
            slots: Mutex::new(None),
            slot_count: cfg.slots,
        });
        let rt = Runtime::with_plugins(
            cfg,
            Arc::new(crate::netpoll::NoopNetPoller),
            Arc::clone(&collector) as Arc<dyn crate::gc::Collector>,
        );
        *collector.slots.lock().unwrap() = Some(Arc::clone(&rt.slots));

        rt.start();
        rt.run_stop_the_world_cycle();
        for slot in rt.slots[..rt.active_slot_count()].iter() {
            assert_ne!(slot.status(), SlotStatus::GcStop);
        }
        rt.shutdown();
    }

    #[test]
    fn stop_the_world_cycle_drives_the_registered_collector() {
        let collector = Arc::new(crate::gc::CountingCollector::new());
        let rt = Runtime::with_plugins(
            test_config(),
            Arc::new(crate::netpoll::NoopNetPoller),
            Arc::clone(&collector) as Arc<dyn crate::gc::Collector>,
        );
        rt.start();
        rt.run_stop_the_world_cycle();
        assert_eq!(collector.cycles(), 1);
        rt.shutdown();
    }

    #[test]
    fn gc_helper_count_never_exceeds_active_slots() {
        let rt = Runtime::new(Config::with_slots(2));
        rt.start();
        assert!(rt.gc_helper_count() <= 2);
        rt.shutdown();
    }

    #[test]
    fn all_tasks_parked_forever_reports_all_asleep() {
        use crate::error::DeadlockKind;
        let rt = Runtime::new(Config::with_slots(2));
        rt.start();

        for _ in 0..2 {
            rt.spawn(0, Box::new(|| TaskStep::Park(Box::new(|| {}))))
                .unwrap();
        }

        let mut observed = None;
        for _ in 0..200 {
            std::thread::sleep(Duration::from_millis(5));
            if let Some(kind) = rt.check_deadlock() {
                observed = Some(kind);
                break;
            }
        }
        assert_eq!(observed, Some(DeadlockKind::AllAsleep));
        rt.shutdown();
    }

    #[test]
    fn foreign_thread_can_be_adopted_and_released() {
        let rt = Runtime::new(test_config());
        let worker = rt.adopt_foreign_thread().unwrap();
        assert_eq!(rt.foreign_call_count(), 1);
        rt.release_foreign_thread(worker);
    }

    #[test]
    fn syscall_round_trip_reacquires_same_slot() {
        let rt = Runtime::new(test_config());
        rt.start();
        let done = Arc::new(StdAtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        let rt2 = Arc::clone(&rt);
        rt.spawn(
            0,
            Box::new(move || {
                rt2.enter_syscall();
                rt2.exit_syscall();
                done2.fetch_add(1, Ordering::SeqCst);
                TaskStep::Complete
            }),
        )
        .unwrap();
        assert!(rt.wait_for_completion(1, Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        rt.shutdown();
    }

    #[test]
    fn deadlock_check_reports_none_while_a_task_is_still_yielding() {
        // A task that keeps re-enqueuing itself via `TaskStep::Yield` never
        // sits on the idle-slot stack between steps, so `check_deadlock`
        // must see `running > 0` for as long as it's looping, regardless
        // of scheduling timing.
        let rt = Runtime::new(test_config());
        rt.start();
        let release = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let release2 = Arc::clone(&release);
        rt.spawn(
            0,
            Box::new(move || {
                if release2.load(Ordering::SeqCst) {
                    TaskStep::Complete
                } else {
                    TaskStep::Yield
                }
            }),
        )
        .unwrap();

        assert!(rt.check_deadlock().is_none());

        release.store(true, Ordering::SeqCst);
        assert!(rt.wait_for_completion(1, Duration::from_secs(5)));
        rt.shutdown();
    }

    #[test]
    fn task_count_by_status_tracks_completed_tasks() {
        let rt = Runtime::new(test_config());
        rt.start();
        rt.spawn(0, Box::new(|| TaskStep::Complete)).unwrap();
        assert!(rt.wait_for_completion(1, Duration::from_secs(5)));
        assert_eq!(
            rt.task_count_by_status(crate::task::TaskStatus::Dead),
            1
        );
        rt.shutdown();
    }

    #[test]
    fn observability_counters_report_sane_values() {
        let rt = Runtime::new(test_config());
        rt.start();
        assert_eq!(rt.worker_count(), 2);
        assert!(rt.idle_slot_count() <= 2);
        assert!(rt.spinning_count() <= rt.worker_count());
        rt.shutdown();
    }

    #[test]
    fn retaken_slot_spawns_a_worker_when_none_are_idle() {
        // spec §8 scenario 4: slotCount=2, 3 tasks each doing a ~100ms
        // "syscall"; the third must run well before the first two return,
        // which requires the monitor to hand its retaken slot to a brand
        // new worker thread rather than only waking an already-idle one.
        let mut cfg = Config::with_slots(2);
        cfg.local_ring_capacity = 4;
        cfg.monitor_min_sleep = Duration::from_micros(200);
        cfg.monitor_max_sleep = Duration::from_millis(2);
        let rt = Runtime::new(cfg);
        rt.start();

        let started = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..3 {
            let rt2 = Arc::clone(&rt);
            let started2 = Arc::clone(&started);
            rt.spawn(
                0,
                Box::new(move || {
                    started2.fetch_add(1, Ordering::SeqCst);
                    rt2.enter_syscall();
                    std::thread::sleep(Duration::from_millis(100));
                    rt2.exit_syscall();
                    TaskStep::Complete
                }),
            )
            .unwrap();
        }

        let before = Instant::now();
        assert!(rt.wait_for_completion(3, Duration::from_millis(250)));
        assert!(before.elapsed() < Duration::from_millis(250));
        assert_eq!(started.load(Ordering::SeqCst), 3);
        rt.shutdown();
    }
}
