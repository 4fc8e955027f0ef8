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

//! Pooled guarded stacks for coroutines.
//!
//! Grounded on the stack pool design in the coroutine library this runtime
//! descends from (`stack/stack_pool.rs`): coroutines that run to completion
//! return their stack to a free list instead of unmapping it, so a busy
//! scheduler doesn't pay `mmap`/`mprotect` cost on every spawn. The guard
//! page itself comes from the `context` crate's `ProtectedFixedSizeStack`
//! rather than the hand-rolled `mmap` + `mprotect` the original pool used.

use context::stack::{ProtectedFixedSizeStack, Stack as StackTrait};
use parking_lot::Mutex;

use crate::config;

/// A stack checked out from a [`StackPool`], or a fresh one if none fit.
pub struct PooledStack(ProtectedFixedSizeStack);

impl PooledStack {
    pub fn min_size(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn raw(&self) -> &ProtectedFixedSizeStack {
        &self.0
    }
}

/// Per-scheduler cache of unused stacks, bucketed loosely by size.
///
/// Not a binary search tree: schedulers only ever request two or three
/// distinct sizes in practice (the configured default, plus whatever a
/// caller overrides), so a linear scan over a short `Vec` is simpler and
/// just as fast as a sorted structure would be.
pub struct StackPool {
    stacks: Mutex<Vec<PooledStack>>,
    max_cached: usize,
}

impl StackPool {
    pub fn new() -> StackPool {
        StackPool {
            stacks: Mutex::new(Vec::new()),
            max_cached: 64,
        }
    }

    pub fn take(&self, min_size: usize) -> PooledStack {
        let mut stacks = self.stacks.lock();
        match stacks.iter().position(|s| min_size <= s.min_size()) {
            Some(idx) => stacks.swap_remove(idx),
            None => new_stack(min_size),
        }
    }

    pub fn give(&self, stack: PooledStack) {
        let mut stacks = self.stacks.lock();
        if stacks.len() < self.max_cached {
            stacks.push(stack);
        }
    }
}

impl Default for StackPool {
    fn default() -> StackPool {
        StackPool::new()
    }
}

fn new_stack(min_size: usize) -> PooledStack {
    let size = min_size.max(ProtectedFixedSizeStack::default_size());
    PooledStack(
        ProtectedFixedSizeStack::new(size)
            .unwrap_or_else(|e| panic!("failed to allocate a {}-byte guarded stack: {}", size, e)),
    )
}

static POOL: once_cell::sync::Lazy<StackPool> = once_cell::sync::Lazy::new(StackPool::new);

/// Check out a stack at least `size` bytes, falling back to the configured
/// default ([`config::fiber_stack_size`]) when `size` is `None`.
pub fn acquire(size: Option<usize>) -> PooledStack {
    let size = size.unwrap_or_else(|| config::fiber_stack_size().get() as usize);
    POOL.take(size)
}

pub fn release(stack: PooledStack) {
    POOL.give(stack);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_large_enough_stacks() {
        let pool = StackPool::new();
        let s = pool.take(16 * 1024);
        let size = s.min_size();
        pool.give(s);
        let s2 = pool.take(4096);
        assert_eq!(s2.min_size(), size);
    }

    #[test]
    fn pool_allocates_fresh_when_nothing_fits() {
        let pool = StackPool::new();
        let s = pool.take(16 * 1024);
        pool.give(s);
        let s2 = pool.take(1024 * 1024);
        assert!(s2.min_size() >= 1024 * 1024);
    }
}
