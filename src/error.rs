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

//! Crate-wide error taxonomy.
//!
//! Hooked syscalls stay bit-compatible with the POSIX functions they replace
//! (they return `-1` and set `errno`, including `ETIMEDOUT` and peer-closed
//! conditions, per the propagation rule in §7 of the design notes); the
//! `Error` type here covers only the higher-level, Rust-native APIs
//! (`Scheduler`, `TimerWheel`, `IoLoop`) that return a `Result` directly.
use std::io;

/// Errors surfaced by the runtime's own APIs.
///
/// `InvalidState` corresponds to the spec's fatal `InvalidState` row (§7):
/// resuming a terminated coroutine, double-arming an event, touching a
/// destroyed timer wheel. These are programming errors, not recoverable
/// runtime conditions, and in practice are raised via `assert!`/
/// `debug_assert!` rather than this variant; the variant exists so that
/// library code which *can* check ahead of time (e.g. `IoLoop::add_event`)
/// can report the same condition as a `Result` instead of panicking.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid coroutine/event state: {0}")]
    InvalidState(String),

    #[error("system call failed: {0}")]
    SystemCall(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
