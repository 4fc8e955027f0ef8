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

//! A coroutine-based asynchronous I/O runtime: stackful fibers scheduled
//! cooperatively across a pool of worker threads, an epoll-backed reactor,
//! and a set of blocking-syscall replacements that park a fiber instead of
//! a thread.
//!
//! The pieces, bottom-up:
//! - [`coroutine`]: stackful coroutines (C1), switched via the `context`
//!   crate.
//! - [`pivot`]: the per-thread bookkeeping a coroutine switch reads and
//!   writes (C2).
//! - [`scheduler`]: the FIFO multi-thread task queue (C3).
//! - [`timer`]: the shared timer wheel (C4).
//! - [`fd`]: process-wide per-fd bookkeeping the hooks consult (C5).
//! - [`io_loop`]: the epoll reactor built on top of a [`scheduler::Scheduler`] (C6).
//! - [`hooks`]: coroutine-aware stand-ins for the blocking syscalls (C7).
//!
//! Nothing here spawns a global runtime implicitly; construct an
//! [`io_loop::IoLoop`] (or a bare [`scheduler::Scheduler`] if no I/O hooks
//! are needed) and drive it explicitly.

pub mod config;
pub mod coroutine;
pub mod error;
pub mod fd;
pub mod hooks;
pub mod io_loop;
pub mod pivot;
pub mod scheduler;
pub mod timer;

pub use coroutine::{Handle, State};
pub use error::{Error, Result};
pub use io_loop::IoLoop;
pub use scheduler::Scheduler;

/// Spawn a coroutine that is not tied to any scheduler (`run_in_scheduler =
/// false`); resuming it yields back to whichever thread calls
/// [`coroutine::resume`], not to a scheduler loop.
pub fn spawn<F>(f: F) -> Handle
where
    F: FnOnce() + Send + 'static,
{
    coroutine::create(f, None, false)
}

/// Yield the currently running coroutine. Equivalent to
/// [`coroutine::yield_now`].
pub fn yield_now() {
    coroutine::yield_now()
}
