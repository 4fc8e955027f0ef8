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

//! Runtime-updatable configuration.
//!
//! Grounded on the original implementation's `ConfigVar<T>` + listener
//! pattern (see `config.h`/`config.cpp` in the project this runtime is
//! drawn from): a value cell plus a list of callbacks invoked with
//! `(old, new)` whenever it changes. Unlike that original, each `ConfigVar`
//! owns its own listener list under a lock instead of living in a
//! dynamically-typed global registry — there is no `Config::Lookup` by
//! string name, just the two concrete statics the core actually needs.

use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

type Listener<T> = Box<dyn Fn(T, T) + Send + Sync>;

/// A single runtime-updatable value with change notification.
///
/// `T` is restricted to values representable as a `u64` (both config knobs
/// the core exposes are durations/byte counts), which keeps the cell
/// lock-free on the read path.
pub struct ConfigVar {
    name: &'static str,
    value: AtomicU64,
    listeners: Mutex<Vec<Listener<u64>>>,
}

impl ConfigVar {
    const fn new(name: &'static str, default: u64) -> Self {
        ConfigVar {
            name,
            value: AtomicU64::new(default),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn set(&self, new_value: u64) {
        let old = self.value.swap(new_value, Ordering::AcqRel);
        if old == new_value {
            return;
        }
        info!("config {} changed from {} to {}", self.name, old, new_value);
        for listener in self.listeners.lock().iter() {
            listener(old, new_value);
        }
    }

    /// Register a callback invoked with `(old, new)` on every change.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }
}

/// Default stackful-coroutine stack size in bytes: `fiber.stack_size`.
pub static FIBER_STACK_SIZE: ConfigVar = ConfigVar::new("fiber.stack_size", 1024 * 1024);

/// Default timeout in milliseconds for hooked `connect`: `tcp.connect.timeout`.
pub static TCP_CONNECT_TIMEOUT_MS: ConfigVar = ConfigVar::new("tcp.connect.timeout", 5000);

/// Sentinel meaning "no timeout configured" for `FdRegistry` timeouts.
pub const INFINITE_TIMEOUT: u64 = u64::MAX;

/// Convenience: wrap a `ConfigVar` reference behind an `Arc`-like handle for
/// callers that want to close over it cheaply. Statics already have
/// `'static` lifetime so this is just a type alias for readability at call
/// sites that pass the var around.
pub type ConfigVarRef = &'static ConfigVar;

pub fn fiber_stack_size() -> ConfigVarRef {
    &FIBER_STACK_SIZE
}

pub fn tcp_connect_timeout() -> ConfigVarRef {
    &TCP_CONNECT_TIMEOUT_MS
}
