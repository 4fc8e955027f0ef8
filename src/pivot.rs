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

//! Per-thread pivot points: the "who is running" and "where do I jump back
//! to" bookkeeping that lets a coroutine yield without knowing who resumed
//! it.
//!
//! Grounded on the `thread_local` `t_fiber`/`t_threadFiber` pair in the
//! original implementation's `fiber.cpp`, generalized to the `context`
//! crate's transfer-of-control model: every `resume`/`yield` round trip
//! produces a *new* `Context` value for the suspended side (the crate
//! recreates it on each switch rather than mutating one in place), so each
//! slot here holds `Option<Context>` and is replaced wholesale on every
//! switch instead of being mutated.
//!
//! Two slots exist, matching the spec's `thread_main` / `scheduler_main`
//! distinction: a coroutine created with `run_in_scheduler = false` yields
//! back to whatever bare thread resumed it directly, while one running
//! under a [`crate::scheduler::Scheduler`] yields back to that scheduler's
//! run loop. Keeping them separate means a thread can host a scheduler loop
//! *and* drive a standalone coroutine without the two stepping on each
//! other's return point.

use std::cell::{Cell, RefCell};
use std::ptr;

use context::Context;

use crate::coroutine::Coroutine;

thread_local! {
    static CURRENT: Cell<*mut Coroutine> = Cell::new(ptr::null_mut());
    static THREAD_MAIN: RefCell<Option<Context>> = RefCell::new(None);
    static SCHEDULER_MAIN: RefCell<Option<Context>> = RefCell::new(None);
}

/// The coroutine currently running on this thread, if any.
pub(crate) fn current_ptr() -> *mut Coroutine {
    CURRENT.with(|c| c.get())
}

pub(crate) fn is_inside_coroutine() -> bool {
    !current_ptr().is_null()
}

/// Record `next` as the running coroutine, returning whatever was running
/// before (restore it when control comes back).
pub(crate) fn set_current(next: *mut Coroutine) -> *mut Coroutine {
    CURRENT.with(|c| c.replace(next))
}

fn slot(run_in_scheduler: bool) -> &'static std::thread::LocalKey<RefCell<Option<Context>>> {
    if run_in_scheduler {
        &SCHEDULER_MAIN
    } else {
        &THREAD_MAIN
    }
}

/// Take this thread's pivot continuation for `run_in_scheduler`, if one has
/// been recorded yet (it hasn't, the very first time anything is resumed on
/// a fresh thread).
pub(crate) fn take_pivot(run_in_scheduler: bool) -> Option<Context> {
    slot(run_in_scheduler).with(|s| s.borrow_mut().take())
}

pub(crate) fn put_pivot(run_in_scheduler: bool, ctx: Context) {
    slot(run_in_scheduler).with(|s| *s.borrow_mut() = Some(ctx));
}
