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

//! Stackful coroutines.
//!
//! Grounded on `coroutine_unique.rs` in the coroutine library this runtime
//! descends from (a coroutine owned through a unique `Handle`, no shared
//! mutable state between the owner and the running fiber) and, for the
//! resume/yield state machine itself, on `Fiber::resume`/`Fiber::YieldToReady`
//! in the original implementation's `fiber.cpp`. The machine-context switch
//! is delegated to the `context` crate instead of the hand-rolled
//! architecture-specific assembly + `build.rs` the teaching library used.
//!
//! # Why `Handle` needs no `unsafe impl Send`
//!
//! A coroutine is a `Box<Coroutine>`: exactly one owner at a time, moved
//! (never shared) between whichever container currently holds it — a
//! scheduler's ready queue, an [`crate::io_loop::IoLoop`] event slot, a
//! timer callback. `Context` and `ProtectedFixedSizeStack` are themselves
//! `Send`, so the compiler derives `Send` for `Coroutine` on its own; there
//! is no raw pointer posing as ownership here; the one raw pointer in this
//! module ([`crate::pivot::current_ptr`]) is a non-owning thread-local
//! marker.

pub mod stack;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use context::{Context, Transfer};
use log::{debug, error};

use crate::pivot;
use stack::PooledStack;

/// Lifecycle state of a coroutine (`Fiber::State` in the original; `State`
/// enum in the teaching library).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Holds a valid context, has not yet finished running.
    Ready,
    /// Currently executing (somewhere on the call stack that led here).
    Running,
    /// Callback returned or panicked; the stack will be recycled once this
    /// coroutine is dropped.
    Terminated,
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Coroutine {
    id: u64,
    name: Option<String>,
    state: State,
    run_in_scheduler: bool,
    stack: Option<PooledStack>,
    context: Option<Context>,
    callback: Option<Callback>,
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}

/// Unique owning reference to a coroutine.
///
/// `Handle`s move between containers (a scheduler's ready queue, an I/O
/// event slot) but are never cloned or shared: at any instant exactly one
/// place in the program owns the right to resume a given coroutine.
pub struct Handle(Box<Coroutine>);

fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Handle {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.0.name = Some(name.into());
    }

    pub fn state(&self) -> State {
        self.0.state
    }

    pub fn run_in_scheduler(&self) -> bool {
        self.0.run_in_scheduler
    }

    fn as_mut_ptr(&mut self) -> *mut Coroutine {
        &mut *self.0 as *mut Coroutine
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A read-only snapshot of the coroutine currently running on this thread.
///
/// Not a [`Handle`]: the coroutine is still owned by whichever `resume`
/// call is live further down this thread's stack, and `Handle`'s whole
/// point is that ownership is never duplicated (see this module's docs).
/// `current()` hands out a copy of its queryable fields instead.
pub struct CurrentCoroutine {
    id: u64,
    name: Option<String>,
    state: State,
    run_in_scheduler: bool,
}

impl CurrentCoroutine {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn run_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }
}

/// The coroutine currently running on this thread, or `None` if called
/// from outside any coroutine.
pub fn current() -> Option<CurrentCoroutine> {
    let ptr = pivot::current_ptr();
    if ptr.is_null() {
        return None;
    }
    // SAFETY: `ptr` was set by `resume` immediately before switching onto
    // this coroutine's stack, and stays valid for as long as this stack is
    // live — the same invariant `yield_now` relies on. The fields read here
    // are copied out rather than the reference itself being retained.
    let coro: &Coroutine = unsafe { &*ptr };
    Some(CurrentCoroutine {
        id: coro.id,
        name: coro.name.clone(),
        state: coro.state,
        run_in_scheduler: coro.run_in_scheduler,
    })
}

/// Spawn a new coroutine. It does not run until the first [`resume`].
///
/// `stack_size` overrides the configured default
/// ([`crate::config::fiber_stack_size`]) for this one coroutine.
pub fn create<F>(f: F, stack_size: Option<usize>, run_in_scheduler: bool) -> Handle
where
    F: FnOnce() + Send + 'static,
{
    let pooled = stack::acquire(stack_size);
    let context = unsafe { Context::new(pooled.raw(), trampoline) };
    Handle(Box::new(Coroutine {
        id: next_id(),
        name: None,
        state: State::Ready,
        run_in_scheduler,
        stack: Some(pooled),
        context: Some(context),
        callback: Some(Box::new(f)),
    }))
}

/// Rebind a `Ready` or `Terminated` coroutine to a new callback, reusing its
/// stack. Mirrors `Coroutine::reset` in the teaching library, used by
/// schedulers that keep a worker's "idle" coroutine around instead of
/// reallocating a stack per task.
pub fn reset<F>(handle: &mut Handle, f: F)
where
    F: FnOnce() + Send + 'static,
{
    assert!(
        matches!(handle.0.state, State::Ready | State::Terminated),
        "reset: coroutine {} is still running",
        handle.0.id
    );
    let stack = handle
        .0
        .stack
        .as_ref()
        .expect("reset: coroutine has no stack (already consumed?)");
    handle.0.context = Some(unsafe { Context::new(stack.raw(), trampoline) });
    handle.0.callback = Some(Box::new(f));
    handle.0.state = State::Ready;
}

/// Resume a `Ready` coroutine on the calling thread. Returns when the
/// coroutine yields (voluntarily, or because it parked on an I/O wait) or
/// terminates.
///
/// # Panics
/// If `handle` is not currently `Ready` (double-resume, resuming a
/// terminated coroutine). This is the `InvalidState` condition from the
/// error taxonomy; it is a programming error in the caller; not raised as a
/// `Result` because every caller in this crate can trivially avoid it by
/// checking `state()` first.
pub fn resume(handle: &mut Handle) {
    assert_eq!(
        handle.0.state,
        State::Ready,
        "resume: coroutine {} is not Ready ({:?})",
        handle.0.id,
        handle.0.state
    );

    let run_in_scheduler = handle.0.run_in_scheduler;
    let ptr = handle.as_mut_ptr();
    let prev_current = pivot::set_current(ptr);
    handle.0.state = State::Running;

    let target_ctx = handle
        .0
        .context
        .take()
        .expect("resume: Ready coroutine missing a context");

    debug!("resuming coroutine {}", handle.0.id);
    let Transfer {
        context: suspended_at,
        ..
    } = target_ctx.resume(0);

    handle.0.context = Some(suspended_at);
    pivot::set_current(prev_current);
}

/// Yield control back to whoever resumed the currently-running coroutine.
///
/// Must be called from inside a coroutine (i.e. with [`pivot::is_inside_coroutine`]
/// true); panics otherwise, since there would be nothing to yield to.
pub fn yield_now() {
    let ptr = pivot::current_ptr();
    assert!(!ptr.is_null(), "yield_now: no coroutine is running on this thread");
    // SAFETY: `ptr` was set by `resume` just before switching onto this
    // coroutine's stack, and stays valid for as long as this stack is live.
    let coro: &mut Coroutine = unsafe { &mut *ptr };
    let run_in_scheduler = coro.run_in_scheduler;
    if coro.state == State::Running {
        coro.state = State::Ready;
    }

    let target = pivot::take_pivot(run_in_scheduler)
        .expect("yield_now: no pivot recorded for this thread");
    let Transfer { context, .. } = target.resume(0);
    pivot::put_pivot(run_in_scheduler, context);
}

extern "C" fn trampoline(t: Transfer) -> ! {
    let ptr = pivot::current_ptr();
    // SAFETY: `resume` sets CURRENT to this coroutine immediately before
    // performing the switch that lands here.
    let coro: &mut Coroutine = unsafe { &mut *ptr };
    pivot::put_pivot(coro.run_in_scheduler, t.context);

    let callback = coro
        .callback
        .take()
        .expect("trampoline: coroutine entered with no callback");

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        error!("coroutine {} panicked: {}", coro.id, msg);
    }

    coro.state = State::Terminated;
    yield_now();
    unreachable!("a Terminated coroutine must never be resumed again");
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            stack::release(stack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut h = create(
            move || {
                ran2.store(true, Ordering::SeqCst);
            },
            None,
            false,
        );
        assert_eq!(h.state(), State::Ready);
        resume(&mut h);
        assert_eq!(h.state(), State::Terminated);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn yields_and_resumes() {
        let steps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let steps2 = steps.clone();
        let mut h = create(
            move || {
                steps2.lock().unwrap().push(1);
                yield_now();
                steps2.lock().unwrap().push(2);
                yield_now();
                steps2.lock().unwrap().push(3);
            },
            None,
            false,
        );
        resume(&mut h);
        assert_eq!(h.state(), State::Ready);
        resume(&mut h);
        assert_eq!(h.state(), State::Ready);
        resume(&mut h);
        assert_eq!(h.state(), State::Terminated);
        assert_eq!(*steps.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "is not Ready")]
    fn resume_terminated_panics() {
        let mut h = create(|| {}, None, false);
        resume(&mut h);
        resume(&mut h);
    }

    #[test]
    fn current_is_none_outside_a_coroutine() {
        assert!(current().is_none());
    }

    #[test]
    fn current_reflects_the_running_coroutine() {
        let seen_id = Arc::new(std::sync::Mutex::new(None));
        let seen_id2 = seen_id.clone();
        let mut h = create(
            move || {
                let cur = current().expect("current() should see the running coroutine");
                assert_eq!(cur.state(), State::Running);
                *seen_id2.lock().unwrap() = Some(cur.id());
            },
            None,
            false,
        );
        let expected_id = h.id();
        resume(&mut h);
        assert_eq!(*seen_id.lock().unwrap(), Some(expected_id));
    }

    #[test]
    fn panicking_callback_still_terminates() {
        let mut h = create(
            || {
                panic!("boom");
            },
            None,
            false,
        );
        resume(&mut h);
        assert_eq!(h.state(), State::Terminated);
    }
}
