// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! FIFO, non-work-stealing multi-thread coroutine scheduler.
//!
//! Grounded on `Scheduler` in the original implementation (`scheduler.h`/
//! `scheduler.cpp`): a single task queue, a pool of worker threads plus an
//! optional "use the caller thread as worker 0" mode, and virtual
//! `Tickle`/`Idle`/`Stopping` hooks that `IoLoop` overrides. The teacher
//! crate's own `scheduler.rs` used a per-thread work-stealing deque (`deque`
//! crate) and a `mio` event loop; this module keeps the teacher's
//! thread-pool-of-coroutine-loops shape (`thread::Builder::spawn` running a
//! `schedule()`-style loop, a thread-local "current scheduler") but
//! generalizes the queue to the single shared FIFO the spec calls for, and
//! replaces the virtual-method hooks with a `Weak<dyn IdleHook>` so
//! `IoLoop` can override idle/tickle behavior through composition instead
//! of inheritance.

use std::cell::Cell;
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};

use crate::coroutine::{self, Handle, State};

/// A coroutine's Handle, on its way to being parked by something that
/// hasn't happened yet when the coroutine yields (a timer or an fd event
/// becoming ready) — see the `io_loop` module docs for why this indirection
/// is needed instead of the coroutine holding a reference to itself.
///
/// Two independent events race to resolve a `ParkSink`: the coroutine
/// yielding (supplying the `Handle`) and the condition firing (supplying
/// the wakeup). Whichever happens second performs the reschedule; the genal
/// rule is encoded as a tiny state machine instead of ad hoc flags so the
/// "it already fired before we could park" case can't be missed. The
/// general rule: whichever side moves the state out of `WaitingForHandle`
/// last is responsible for the reschedule.
pub enum ParkState {
    WaitingForHandle,
    Handle(Handle),
    Fired,
}

pub type ParkSink = Arc<Mutex<ParkState>>;

thread_local! {
    static PENDING_PARK_SINK: Cell<Option<ParkSink>> = Cell::new(None);
}

/// Call immediately before [`coroutine::yield_now`] when parking on a
/// condition that will resolve the returned sink from another context (a
/// timer callback, an I/O readiness callback).
pub fn set_pending_park_sink(sink: ParkSink) {
    PENDING_PARK_SINK.with(|c| c.set(Some(sink)));
}

fn take_pending_park_sink() -> Option<ParkSink> {
    PENDING_PARK_SINK.with(|c| c.take())
}

/// Resolve `sink` with the coroutine that is ready to run again. If the
/// condition already fired before the coroutine reached
/// [`coroutine::yield_now`], reschedule `handle` immediately instead.
pub(crate) fn settle_park_sink(sink: &ParkSink, scheduler: &Arc<Scheduler>, handle: Handle) {
    let mut state = sink.lock();
    match std::mem::replace(&mut *state, ParkState::WaitingForHandle) {
        ParkState::Fired => {
            drop(state);
            scheduler.schedule_handle(handle, None);
        }
        ParkState::WaitingForHandle => {
            *state = ParkState::Handle(handle);
        }
        ParkState::Handle(_) => unreachable!("park sink already holds a handle"),
    }
}

/// Resolve `sink` from the firing side (a timer or readiness callback). If
/// a coroutine is already parked there, reschedule it; otherwise just mark
/// the sink fired so the coroutine is rescheduled immediately once it does
/// park.
pub fn fire_park_sink(sink: &ParkSink, scheduler: &Arc<Scheduler>) {
    let mut state = sink.lock();
    match std::mem::replace(&mut *state, ParkState::Fired) {
        ParkState::Handle(h) => {
            drop(state);
            scheduler.schedule_handle(h, None);
        }
        ParkState::WaitingForHandle => {}
        ParkState::Fired => warn!("park sink fired twice"),
    }
}

/// Hooks a scheduler subtype (in practice, [`crate::io_loop::IoLoop`])
/// installs to replace the plain scheduler's condvar-based idle wait.
pub trait IdleHook: Send + Sync {
    /// One pass of idle work, run synchronously on the per-worker idle
    /// coroutine. Must not call [`coroutine::yield_now`] itself — the run
    /// loop yields once after every pass.
    fn idle_pass(&self, scheduler: &Scheduler);
    fn tickle(&self, scheduler: &Scheduler);
    /// Extra condition (beyond "queue empty") the scheduler must also
    /// satisfy before it may stop. `IoLoop` requires `pending_event_count
    /// == 0` and no armed timers.
    fn extra_stopping(&self, scheduler: &Scheduler) -> bool {
        let _ = scheduler;
        true
    }

    /// Called instead of immediately re-enqueueing a fiber that yielded
    /// with state `Ready`. The default just re-enqueues it on the same
    /// worker; `IoLoop` overrides this to park the fiber in whichever event
    /// slot it just armed instead.
    fn park_or_requeue(&self, scheduler: &Arc<Scheduler>, handle: Handle, worker: usize) {
        match take_pending_park_sink() {
            Some(sink) => settle_park_sink(&sink, scheduler, handle),
            None => scheduler.schedule_handle(handle, Some(worker)),
        }
    }

    /// Called once, at the very start of a worker's run loop (including the
    /// `use_caller` root coroutine). `IoLoop` uses this to record itself in
    /// a thread-local so the syscall hooks can find it.
    fn on_worker_start(&self, worker: usize) {
        let _ = worker;
    }
}

struct NoopHooks;

impl IdleHook for NoopHooks {
    fn idle_pass(&self, scheduler: &Scheduler) {
        scheduler.park_briefly();
    }
    fn tickle(&self, scheduler: &Scheduler) {
        trace!("scheduler {}: tickle (condvar)", scheduler.name);
        scheduler.notify_parked();
    }
}

enum TaskBody {
    Fiber(Handle),
    Callable(Box<dyn FnOnce() + Send + 'static>),
}

struct Task {
    body: TaskBody,
    target: Option<usize>,
}

thread_local! {
    static CURRENT_SCHEDULER: Cell<*const Scheduler> = Cell::new(ptr::null());
    static CURRENT_WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

/// A FIFO task queue driven by one coroutine-loop per worker thread.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    idle_mutex: Mutex<()>,
    idle_cond: Condvar,
    use_caller: bool,
    thread_count: usize,
    stopping: AtomicBool,
    started: AtomicBool,
    active_thread_count: AtomicUsize,
    idle_thread_count: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    root_coroutine: Mutex<Option<Handle>>,
    hooks: Mutex<Weak<dyn IdleHook>>,
}

impl Scheduler {
    /// Construct a plain scheduler (tickle is a logging no-op, idle parks
    /// briefly on a condvar). `IoLoop` builds its own via
    /// [`Scheduler::with_hooks`].
    pub fn new(thread_count: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        let sched = Self::with_hooks(thread_count, use_caller, name, Weak::<NoopHooks>::new());
        let hooks: Arc<dyn IdleHook> = Arc::new(NoopHooks);
        *sched.hooks.lock() = Arc::downgrade(&hooks);
        // Leak the NoopHooks Arc's strong count into the scheduler itself so
        // it outlives every weak upgrade: store it as a root coroutine? No —
        // simplest is to keep one strong Arc alive for the scheduler's
        // lifetime via a side table.
        NOOP_HOOKS_KEEPALIVE.lock().push(hooks);
        sched
    }

    /// Construct a scheduler whose idle/tickle behavior is delegated to
    /// `hooks` (a weak reference so the owner, e.g. an `Arc<IoLoop>` built
    /// with `Arc::new_cyclic`, doesn't create a reference cycle).
    pub fn with_hooks(
        thread_count: usize,
        use_caller: bool,
        name: impl Into<String>,
        hooks: Weak<dyn IdleHook>,
    ) -> Arc<Scheduler> {
        assert!(thread_count >= 1, "scheduler needs at least one worker");
        let effective = if use_caller { thread_count - 1 } else { thread_count };
        Arc::new(Scheduler {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            idle_mutex: Mutex::new(()),
            idle_cond: Condvar::new(),
            use_caller,
            thread_count: effective,
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            active_thread_count: AtomicUsize::new(0),
            idle_thread_count: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            root_coroutine: Mutex::new(None),
            hooks: Mutex::new(hooks),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_thread_count.load(Ordering::SeqCst) > 0
    }

    /// The coroutine driving this scheduler's `use_caller` root thread, if
    /// `start()` has materialized one (`use_caller = true` schedulers only).
    pub fn scheduler_main_coroutine(&self) -> Option<MappedMutexGuard<'_, Handle>> {
        MutexGuard::try_map(self.root_coroutine.lock(), |root| root.as_mut()).ok()
    }

    fn hooks(&self) -> Option<Arc<dyn IdleHook>> {
        self.hooks.lock().upgrade()
    }

    fn tickle(&self) {
        match self.hooks() {
            Some(h) => h.tickle(self),
            None => self.notify_parked(),
        }
    }

    fn park_briefly(&self) {
        let mut guard = self.idle_mutex.lock();
        self.idle_cond.wait_for(&mut guard, Duration::from_millis(50));
    }

    fn notify_parked(&self) {
        self.idle_cond.notify_all();
    }

    /// Enqueue a fiber or callable task. `target`: `None` means "any
    /// worker"; `Some(id)` pins it to worker `id`.
    fn schedule_task(self: &Arc<Self>, body: TaskBody, target: Option<usize>) {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(Task { body, target });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub fn schedule(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        self.schedule_task(TaskBody::Callable(Box::new(f)), None);
    }

    pub fn schedule_to(self: &Arc<Self>, thread: usize, f: impl FnOnce() + Send + 'static) {
        self.schedule_task(TaskBody::Callable(Box::new(f)), Some(thread));
    }

    /// Enqueue a whole batch of any-worker tasks under a single lock
    /// acquisition, tickling at most once for the batch instead of once per
    /// task. Mirrors the original scheduler's range-accepting `schedule`
    /// overload.
    pub fn schedule_many<F, I>(self: &Arc<Self>, tasks: I)
    where
        F: FnOnce() + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            let mut any = false;
            for f in tasks {
                q.push_back(Task {
                    body: TaskBody::Callable(Box::new(f)),
                    target: None,
                });
                any = true;
            }
            was_empty && any
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub(crate) fn schedule_handle(self: &Arc<Self>, handle: Handle, target: Option<usize>) {
        self.schedule_task(TaskBody::Fiber(handle), target);
    }

    fn pop_for(&self, worker: usize) -> (Option<Task>, bool) {
        let mut q = self.queue.lock();
        let mut scanned = 0;
        let mut tickle_needed = false;
        while scanned < q.len() {
            let idx = scanned;
            let matches = match q[idx].target {
                None => true,
                Some(t) => t == worker,
            };
            if matches {
                let task = q.remove(idx).unwrap();
                if !q.is_empty() {
                    tickle_needed = true;
                }
                return (Some(task), tickle_needed);
            }
            tickle_needed = true;
            scanned += 1;
        }
        (None, tickle_needed)
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn base_stopping(&self) -> bool {
        self.is_stopping() && self.queue_is_empty()
    }

    pub(crate) fn stopping(&self) -> bool {
        let extra = self.hooks().map(|h| h.extra_stopping(self)).unwrap_or(true);
        self.base_stopping() && extra
    }

    /// Idempotent: spawn worker threads (and, in `use_caller` mode,
    /// materialize the root coroutine for the caller thread).
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);
        info!("scheduler {}: starting {} worker thread(s) (use_caller={})", self.name, self.thread_count, self.use_caller);

        let mut threads = self.threads.lock();
        for worker in 0..self.thread_count {
            let sched = self.clone();
            let worker_id = if self.use_caller { worker + 1 } else { worker };
            let name = format!("{}-worker-{}", self.name, worker_id);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || sched.run_loop(worker_id))
                .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }

        if self.use_caller {
            let sched = self.clone();
            let root = coroutine::create(
                move || sched.run_loop(0),
                None,
                true,
            );
            *self.root_coroutine.lock() = Some(root);
        }
    }

    /// Run the scheduler on the calling thread until it stops. Only valid
    /// for `use_caller` schedulers; resumes the root coroutine repeatedly
    /// until it terminates.
    pub fn run_on_caller(self: &Arc<Self>) {
        assert!(self.use_caller, "run_on_caller: scheduler was not built with use_caller");
        self.start();
        loop {
            let mut root = self.root_coroutine.lock();
            match root.as_mut() {
                Some(h) if h.state() == State::Terminated => break,
                Some(h) => {
                    let h = root.take().unwrap();
                    drop(root);
                    let mut h = h;
                    coroutine::resume(&mut h);
                    *self.root_coroutine.lock() = Some(h);
                }
                None => break,
            }
        }
    }

    /// Request shutdown. Tickles every worker (plus the root, if any) so
    /// they notice `stopping` promptly, then blocks until all spawned
    /// worker threads have exited.
    pub fn stop(self: &Arc<Self>) {
        if self.base_stopping() && self.threads.lock().is_empty() && self.root_coroutine.lock().is_none() {
            debug!("scheduler {}: stop() on an already-quiescent scheduler", self.name);
            return;
        }
        // Ensure worker threads (and the root coroutine, in use_caller mode)
        // actually exist before latching `stopping`: `start()` resets
        // `stopping` to false on its first call, and `run_on_caller()` below
        // calls `start()` itself, so setting `stopping` before this point
        // would be erased by a `stop()` that races a never-started scheduler.
        self.start();
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..(self.thread_count + 1) {
            self.tickle();
        }

        if self.use_caller {
            self.run_on_caller();
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for h in handles {
            let _ = h.join();
        }
        info!("scheduler {}: stopped", self.name);
    }

    fn run_loop(self: Arc<Self>, worker_id: usize) {
        CURRENT_SCHEDULER.with(|c| c.set(Arc::as_ptr(&self)));
        CURRENT_WORKER_ID.with(|c| c.set(Some(worker_id)));
        if let Some(h) = self.hooks() {
            h.on_worker_start(worker_id);
        }
        self.active_thread_count.fetch_add(1, Ordering::SeqCst);

        let mut idle_coroutine: Option<Handle> = None;
        let mut carrier: Option<Handle> = None;

        loop {
            if self.stopping() {
                if idle_coroutine.as_ref().map(|h| h.state() == State::Terminated).unwrap_or(true) {
                    break;
                }
            }

            let (task, tickle_needed) = self.pop_for(worker_id);
            if tickle_needed {
                self.tickle();
            }

            match task {
                Some(Task { body: TaskBody::Fiber(mut handle), .. }) => {
                    coroutine::resume(&mut handle);
                    match handle.state() {
                        State::Ready => match self.hooks() {
                            Some(h) => h.park_or_requeue(&self, handle, worker_id),
                            None => self.schedule_handle(handle, Some(worker_id)),
                        },
                        State::Terminated => drop(handle),
                        State::Running => unreachable!("coroutine returned from resume() still Running"),
                    }
                }
                Some(Task { body: TaskBody::Callable(f), .. }) => {
                    let h = carrier.get_or_insert_with(|| coroutine::create(|| {}, None, true));
                    coroutine::reset(h, f);
                    coroutine::resume(h);
                    if h.state() == State::Ready {
                        trace!("scheduler {}: callable task parked mid-run, promoting to a tracked fiber", self.name);
                        let taken = carrier.take().unwrap();
                        match self.hooks() {
                            Some(hooks) => hooks.park_or_requeue(&self, taken, worker_id),
                            None => self.schedule_handle(taken, Some(worker_id)),
                        }
                    }
                }
                None => {
                    self.idle_thread_count.fetch_add(1, Ordering::SeqCst);
                    let idle = idle_coroutine.get_or_insert_with(|| {
                        let sched = self.clone();
                        coroutine::create(move || sched.idle_body(), None, true)
                    });
                    if idle.state() == State::Terminated {
                        let sched = self.clone();
                        coroutine::reset(idle, move || sched.idle_body());
                    }
                    coroutine::resume(idle);
                    self.idle_thread_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        self.active_thread_count.fetch_sub(1, Ordering::SeqCst);
        CURRENT_SCHEDULER.with(|c| c.set(ptr::null()));
        CURRENT_WORKER_ID.with(|c| c.set(None));
    }

    fn idle_body(self: Arc<Self>) {
        loop {
            if self.stopping() {
                return;
            }
            match self.hooks() {
                Some(h) => h.idle_pass(&self),
                None => self.park_briefly(),
            }
            coroutine::yield_now();
        }
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}

static NOOP_HOOKS_KEEPALIVE: Mutex<Vec<Arc<dyn IdleHook>>> = Mutex::new(Vec::new());

/// The scheduler driving the calling thread's run loop, if any.
pub fn current() -> Option<*const Scheduler> {
    let ptr = CURRENT_SCHEDULER.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

pub fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER_ID.with(|c| c.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_scheduled_callables_in_order() {
        let sched = Scheduler::new(2, false, "test");
        let order = Arc::new(Mutex::new(Vec::new()));
        sched.start();
        for i in 0..5 {
            let order = order.clone();
            sched.schedule(move || {
                order.lock().push(i);
            });
        }
        thread::sleep(Duration::from_millis(100));
        sched.stop();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn use_caller_with_single_thread_spawns_no_workers() {
        let sched = Scheduler::new(1, true, "caller-only");
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        sched.schedule(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sched.threads.lock().is_empty());
    }

    #[test]
    fn schedule_many_runs_every_task() {
        let sched = Scheduler::new(2, false, "batch-test");
        sched.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks = (0..5).map(|i| {
            let order = order.clone();
            move || {
                order.lock().push(i);
            }
        });
        sched.schedule_many(tasks);
        thread::sleep(Duration::from_millis(100));
        sched.stop();
        let mut seen = order.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn scheduler_main_coroutine_is_available_only_in_use_caller_mode() {
        let plain = Scheduler::new(1, false, "no-caller");
        plain.start();
        assert!(plain.scheduler_main_coroutine().is_none());
        plain.stop();

        let caller = Scheduler::new(1, true, "with-caller");
        caller.start();
        assert!(caller.scheduler_main_coroutine().is_some());
        caller.stop();
    }
}
