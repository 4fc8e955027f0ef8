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

//! Timer wheel: an ordered set of deadlines shared by a scheduler.
//!
//! Grounded on `timer.h`/`timer.cpp` in the original implementation this
//! runtime is drawn from (`Timer`, `TimerManager`, the `(next, identity)`
//! ordering, and the rollback-detection heuristic in `DetectClockRollover`).
//! The teacher crate has no timer facility of its own to generalize; this
//! module is new, built the way the rest of the crate is: a `parking_lot`
//! reader-writer lock guarding a `BTreeSet` ordered by `(deadline, id)`,
//! mirroring the original's `std::set<Timer::ptr, Comparator>`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use log::{trace, warn};
use parking_lot::RwLock;

/// A millisecond timestamp since an arbitrary monotonic epoch.
pub type Millis = u64;

/// Sentinel `next_timeout_ms()` result meaning "no timer is armed".
pub const NO_TIMEOUT: Millis = Millis::MAX;

/// Beyond this much backward jump in the clock, every timer is considered
/// expired (`# CLOCK-ROLLBACK` in the design notes).
const ROLLBACK_THRESHOLD_MS: i64 = 3_600_000;

fn now_ms() -> Millis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as Millis
}

type Callback = Box<dyn FnMut() + Send>;

struct Entry {
    deadline: Millis,
    id: u64,
    recurring: Option<Millis>,
    callback: Option<Callback>,
}

impl Entry {
    fn key(&self) -> (Millis, u64) {
        (self.deadline, self.id)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

/// Opaque handle returned by [`TimerWheel::add_timer`]; pass to `cancel`,
/// `refresh` or `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Inner {
    entries: BTreeSet<Entry>,
    intervals: std::collections::HashMap<u64, Millis>,
    previous_now: Millis,
    tickled: bool,
}

/// Callback run for every hook invoked by [`TimerWheel::on_earliest_changed`].
pub trait EarliestChangedHook: Send + Sync {
    fn on_earliest_changed(&self);
}

/// An ordered set of timers shared by a scheduler (one per [`crate::io_loop::IoLoop`]).
pub struct TimerWheel {
    inner: RwLock<Inner>,
    hook: Option<Box<dyn EarliestChangedHook>>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            inner: RwLock::new(Inner {
                entries: BTreeSet::new(),
                intervals: std::collections::HashMap::new(),
                previous_now: now_ms(),
                tickled: false,
            }),
            hook: None,
        }
    }

    pub fn with_hook(hook: Box<dyn EarliestChangedHook>) -> TimerWheel {
        TimerWheel {
            inner: RwLock::new(Inner {
                entries: BTreeSet::new(),
                intervals: std::collections::HashMap::new(),
                previous_now: now_ms(),
                tickled: false,
            }),
            hook: Some(hook),
        }
    }

    fn next_id() -> u64 {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a new timer firing `ms` milliseconds from now.
    pub fn add_timer<F>(&self, ms: Millis, callback: F, recurring: bool) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(ms, Box::new(callback), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only fires if
    /// `witness` still upgrades when the deadline is reached; otherwise the
    /// timer silently no-ops, which is how a conditional timer auto-cancels
    /// when its owner has been dropped.
    pub fn add_conditional_timer<T, F>(
        &self,
        ms: Millis,
        mut callback: F,
        witness: Weak<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        T: Send + Sync + 'static,
        F: FnMut(std::sync::Arc<T>) + Send + 'static,
    {
        let guarded: Callback = Box::new(move || {
            if let Some(strong) = witness.upgrade() {
                callback(strong);
            }
        });
        self.insert(ms, guarded, recurring)
    }

    fn insert(&self, ms: Millis, callback: Callback, recurring: bool) -> TimerHandle {
        let id = Self::next_id();
        let deadline = now_ms().saturating_add(ms);
        let mut inner = self.inner.write();
        let becomes_earliest = inner
            .entries
            .iter()
            .next()
            .map(|e| deadline < e.deadline)
            .unwrap_or(true);
        if recurring {
            inner.intervals.insert(id, ms);
        }
        inner.entries.insert(Entry {
            deadline,
            id,
            recurring: if recurring { Some(ms) } else { None },
            callback: Some(callback),
        });
        if becomes_earliest && !inner.tickled {
            inner.tickled = true;
            drop(inner);
            if let Some(hook) = &self.hook {
                hook.on_earliest_changed();
            }
        }
        TimerHandle(id)
    }

    /// Remove a timer. Idempotent: returns whether an entry was actually
    /// removed.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.write();
        inner.intervals.remove(&handle.0);
        let found = inner.entries.iter().find(|e| e.id == handle.0).map(|e| e.key());
        match found {
            Some(key) => {
                inner.entries.retain(|e| e.key() != key);
                true
            }
            None => false,
        }
    }

    /// Re-insert at `now + interval`, using whatever interval it was most
    /// recently given (via `add_timer` or `reset`).
    pub fn refresh(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.write();
        let interval = match inner.intervals.get(&handle.0).copied() {
            Some(i) => i,
            None => {
                warn!("refresh: timer {} has no known interval", handle.0);
                return false;
            }
        };
        let Some(key) = inner.entries.iter().find(|e| e.id == handle.0).map(|e| e.key()) else {
            return false;
        };
        let mut entry = inner.entries.take(&Entry {
            deadline: key.0,
            id: key.1,
            recurring: None,
            callback: None,
        }).expect("entry found above must still be present");
        entry.deadline = now_ms().saturating_add(interval);
        inner.entries.insert(entry);
        true
    }

    /// Change a timer's period. `from_now`: the new deadline is `now +
    /// new_ms`; otherwise it is `old_deadline - old_interval + new_ms`.
    pub fn reset(&self, handle: TimerHandle, new_ms: Millis, from_now: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(key) = inner.entries.iter().find(|e| e.id == handle.0).map(|e| e.key()) else {
            return false;
        };
        let mut entry = inner.entries.take(&Entry {
            deadline: key.0,
            id: key.1,
            recurring: None,
            callback: None,
        }).expect("entry found above must still be present");
        let old_interval = entry.recurring.or_else(|| inner.intervals.get(&handle.0).copied());
        entry.deadline = if from_now {
            now_ms().saturating_add(new_ms)
        } else {
            let old = old_interval.unwrap_or(0);
            entry.deadline.saturating_sub(old).saturating_add(new_ms)
        };
        if entry.recurring.is_some() {
            entry.recurring = Some(new_ms);
        }
        inner.intervals.insert(handle.0, new_ms);
        inner.entries.insert(entry);
        true
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.read().entries.is_empty()
    }

    fn detect_rollback(inner: &mut Inner, now: Millis) -> bool {
        let rolled_back = (now as i64) < (inner.previous_now as i64) - ROLLBACK_THRESHOLD_MS;
        inner.previous_now = now;
        rolled_back
    }

    /// Milliseconds until the earliest deadline, or [`NO_TIMEOUT`] if no
    /// timer is armed. Clears the "tickled" flag: a reader has now observed
    /// the current head.
    pub fn next_timeout_ms(&self) -> Millis {
        let now = now_ms();
        let mut inner = self.inner.write();
        inner.tickled = false;
        if Self::detect_rollback(&mut inner, now) {
            return 0;
        }
        match inner.entries.iter().next() {
            None => NO_TIMEOUT,
            Some(e) if e.deadline <= now => 0,
            Some(e) => e.deadline - now,
        }
    }

    /// Append every callback whose deadline has passed to `out`, re-inserting
    /// recurring ones at `now + interval`. Caller invokes the callbacks
    /// after releasing whatever locks it holds (hence returning them rather
    /// than calling them here).
    pub fn drain_expired(&self, out: &mut Vec<Callback>) {
        let now = now_ms();
        let mut inner = self.inner.write();
        let rolled_back = Self::detect_rollback(&mut inner, now);

        let expired: Vec<Entry> = if rolled_back {
            trace!("timer wheel: clock rollback detected, draining all timers");
            std::mem::take(&mut inner.entries).into_iter().collect()
        } else {
            let mut expired = Vec::new();
            while let Some(first) = inner.entries.iter().next() {
                if first.deadline > now {
                    break;
                }
                let key = first.key();
                let entry = inner.entries.take(&Entry {
                    deadline: key.0,
                    id: key.1,
                    recurring: None,
                    callback: None,
                }).expect("peeked entry must still be present");
                expired.push(entry);
            }
            expired
        };

        for mut entry in expired {
            if let Some(cb) = entry.callback.take() {
                out.push(cb);
            }
            if let Some(interval) = entry.recurring {
                inner.entries.insert(Entry {
                    deadline: now.saturating_add(interval),
                    id: entry.id,
                    recurring: Some(interval),
                    callback: entry.callback.take().or(None),
                });
            } else {
                inner.intervals.remove(&entry.id);
            }
        }
    }
}

impl Default for TimerWheel {
    fn default() -> TimerWheel {
        TimerWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::Arc;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn fires_after_deadline() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        wheel.add_timer(10, move || { f2.fetch_add(1, O::SeqCst); }, false);
        sleep(Duration::from_millis(30));
        let mut out = Vec::new();
        wheel.drain_expired(&mut out);
        for mut cb in out {
            cb();
        }
        assert_eq!(fired.load(O::SeqCst), 1);
        assert!(!wheel.has_timer());
    }

    #[test]
    fn recurring_timer_reinserts() {
        let wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let handle = wheel.add_timer(10, move || { c2.fetch_add(1, O::SeqCst); }, true);
        for _ in 0..3 {
            sleep(Duration::from_millis(15));
            let mut out = Vec::new();
            wheel.drain_expired(&mut out);
            for mut cb in out {
                cb();
            }
        }
        assert!(count.load(O::SeqCst) >= 2);
        assert!(wheel.cancel(handle));
        assert!(!wheel.cancel(handle));
    }

    #[test]
    fn conditional_timer_noop_after_witness_dropped() {
        let wheel = TimerWheel::new();
        let witness = Arc::new(42u32);
        let weak = Arc::downgrade(&witness);
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        wheel.add_conditional_timer(10, move |_v| { f2.fetch_add(1, O::SeqCst); }, weak, false);
        drop(witness);
        sleep(Duration::from_millis(20));
        let mut out = Vec::new();
        wheel.drain_expired(&mut out);
        for mut cb in out {
            cb();
        }
        assert_eq!(fired.load(O::SeqCst), 0);
    }
}
