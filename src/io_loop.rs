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

//! Epoll-backed readiness loop: arms/disarms per-fd events and wakes the
//! coroutines (or callbacks) waiting on them.
//!
//! Grounded on `IOManager` in the original implementation (`iomanager.h`/
//! `iomanager.cpp`): one epoll fd, a self-pipe for tickling a thread blocked
//! in `epoll_wait`, and a `FdContext` per descriptor holding up to one
//! continuation per direction. Built as a [`crate::scheduler::IdleHook`]
//! plugged into a [`Scheduler`] via `Arc::new_cyclic`, rather than the
//! original's virtual-method subclassing.
//!
//! # Parking a coroutine without shared ownership
//!
//! The original stores a `shared_ptr<Fiber>` pointing to itself inside the
//! event context it just armed, taken via `Fiber::GetThis()` while still
//! running on its own stack. This crate keeps coroutines unique-owned
//! ([`Handle`] is a `Box`, see `coroutine` module docs), so a coroutine
//! cannot hand a reference to itself to anyone while it's still running —
//! only the scheduler's run loop, which is suspended in
//! [`coroutine::resume`] at that moment, actually holds the `Handle`.
//! Instead, `add_event` hands the coroutine a [`ParkSink`] and leaves the
//! slot's continuation as [`Continuation::Sink`]; once the coroutine yields
//! and control returns to the run loop, the default
//! [`IdleHook::park_or_requeue`] (shared with [`crate::hooks`]'s sleep
//! parking) resolves that same sink instead of re-queueing the fiber. This
//! is a deliberate divergence in mechanism, not in observable behavior.

use std::cell::Cell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{error, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::coroutine;
use crate::error::{Error, Result};
use crate::scheduler::{self, IdleHook, ParkSink, ParkState, Scheduler};
use crate::timer::{EarliestChangedHook, Millis, TimerHandle, TimerWheel, NO_TIMEOUT};

const MAX_WAIT_MS: Millis = 3000;
const INITIAL_SLOTS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event(u32);

impl Event {
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    fn bits(self) -> u32 {
        self.0
    }
}

enum Continuation {
    Sink(ParkSink),
    Callback(Box<dyn FnOnce() + Send>),
}

struct SlotState {
    events: u32,
    read: Option<Continuation>,
    write: Option<Continuation>,
}

impl SlotState {
    fn new() -> SlotState {
        SlotState { events: 0, read: None, write: None }
    }

    fn slot_mut(&mut self, event: Event) -> &mut Option<Continuation> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

struct FdEventSlot {
    state: Mutex<SlotState>,
}

impl FdEventSlot {
    fn new() -> FdEventSlot {
        FdEventSlot { state: Mutex::new(SlotState::new()) }
    }
}

thread_local! {
    static CURRENT_IO_LOOP: Cell<*const IoLoop> = Cell::new(std::ptr::null());
}

/// The `IoLoop` driving the calling thread's worker, if any. Used by
/// [`crate::hooks`] to find the reactor to arm events on.
pub fn current() -> Option<&'static IoLoop> {
    let ptr = CURRENT_IO_LOOP.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        // SAFETY: only ever set to `self` from `IoLoop::on_worker_start`,
        // which runs on a thread whose lifetime is bounded by the `IoLoop`
        // staying alive (the scheduler that owns this thread is itself a
        // field of the `IoLoop`).
        Some(unsafe { &*ptr })
    }
}

struct TimerTickle(Weak<IoLoop>);

impl EarliestChangedHook for TimerTickle {
    fn on_earliest_changed(&self) {
        if let Some(io_loop) = self.0.upgrade() {
            io_loop.tickle_raw();
        }
    }
}

/// The epoll-backed reactor. Wraps a [`Scheduler`] and supplies its idle
/// and tickle behavior.
pub struct IoLoop {
    scheduler: Arc<Scheduler>,
    epoll_fd: RawFd,
    tickle_read: RawFd,
    tickle_write: RawFd,
    slots: RwLock<Vec<FdEventSlot>>,
    timers: TimerWheel,
    pending_event_count: AtomicUsize,
    closed: AtomicBool,
}

impl IoLoop {
    pub fn new(thread_count: usize, use_caller: bool, name: impl Into<String>) -> Arc<IoLoop> {
        let name = name.into();
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epoll_fd >= 0, "epoll_create1 failed: {}", io::Error::last_os_error());

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert!(rc == 0, "pipe2 failed: {}", io::Error::last_os_error());
        let (tickle_read, tickle_write) = (fds[0], fds[1]);

        let io_loop = Arc::new_cyclic(|weak: &Weak<IoLoop>| {
            let scheduler_hook: Weak<dyn IdleHook> = weak.clone();
            let scheduler = Scheduler::with_hooks(thread_count, use_caller, name, scheduler_hook);
            let timer_hook: Box<dyn EarliestChangedHook> = Box::new(TimerTickle(weak.clone()));
            IoLoop {
                scheduler,
                epoll_fd,
                tickle_read,
                tickle_write,
                slots: RwLock::new((0..INITIAL_SLOTS).map(|_| FdEventSlot::new()).collect()),
                timers: TimerWheel::with_hook(timer_hook),
                pending_event_count: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }
        });

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_read as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_read, &mut ev) };
        assert!(rc == 0, "failed to register tickle pipe with epoll: {}", io::Error::last_os_error());

        io_loop.scheduler().start();
        io_loop
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_event_count.load(Ordering::SeqCst)
    }

    fn ensure_slot(&self, fd: RawFd) {
        let idx = fd as usize;
        if self.slots.read().len() > idx {
            return;
        }
        let mut slots = self.slots.write();
        if slots.len() <= idx {
            let new_len = ((idx as f64 + 1.0) * 1.5) as usize;
            while slots.len() < new_len.max(idx + 1) {
                slots.push(FdEventSlot::new());
            }
        }
    }

    fn tickle_raw(&self) {
        let byte = [1u8; 1];
        let rc = unsafe { libc::write(self.tickle_write, byte.as_ptr() as *const _, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!("io_loop: tickle write failed: {}", err);
            }
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe { libc::read(self.tickle_read, buf.as_mut_ptr() as *mut _, buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }

    /// Arm `event` on `fd`. If `callback` is `None`, the currently running
    /// coroutine is the one parked: a [`ParkSink`] is registered with the
    /// scheduler (see [`scheduler::set_pending_park_sink`]) and the caller
    /// must call [`coroutine::yield_now`] immediately after this returns
    /// `Ok`.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        self.ensure_slot(fd);
        let slots = self.slots.read();
        let slot = &slots[fd as usize];
        let mut state = slot.state.lock();
        if state.events & event.bits() != 0 {
            return Err(Error::InvalidState(format!(
                "fd {} event {:?} already armed",
                fd,
                event.bits()
            )));
        }

        let op = if state.events == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let new_events = state.events | event.bits();
        let mut ev = libc::epoll_event {
            events: new_events | (libc::EPOLLET as u32),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(Error::SystemCall(io::Error::last_os_error()));
        }

        state.events = new_events;
        match callback {
            Some(cb) => *state.slot_mut(event) = Some(Continuation::Callback(cb)),
            None => {
                let sink: ParkSink = Arc::new(Mutex::new(ParkState::WaitingForHandle));
                *state.slot_mut(event) = Some(Continuation::Sink(sink.clone()));
                scheduler::set_pending_park_sink(sink);
            }
        }
        self.pending_event_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Disarm `event` without firing its continuation.
    pub fn remove_event(&self, fd: RawFd, event: Event) -> bool {
        let slots = self.slots.read();
        if fd as usize >= slots.len() {
            return false;
        }
        let slot = &slots[fd as usize];
        let mut state = slot.state.lock();
        if state.events & event.bits() == 0 {
            return false;
        }
        self.update_epoll_after_clear(fd, &mut state, event);
        *state.slot_mut(event) = None;
        self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm `event` and fire its continuation once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let slots = self.slots.read();
        if fd as usize >= slots.len() {
            return false;
        }
        let slot = &slots[fd as usize];
        let cont = {
            let mut state = slot.state.lock();
            if state.events & event.bits() == 0 {
                return false;
            }
            self.update_epoll_after_clear(fd, &mut state, event);
            let c = state.slot_mut(event).take();
            self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
            c
        };
        self.fire_continuation(cont);
        true
    }

    /// Disarm everything on `fd` and fire both continuations if armed
    /// (used by hooked `close`).
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let slots = self.slots.read();
        if fd as usize >= slots.len() {
            return false;
        }
        let slot = &slots[fd as usize];
        let (read, write, had_any) = {
            let mut state = slot.state.lock();
            if state.events == 0 {
                (None, None, false)
            } else {
                let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
                if rc != 0 {
                    warn!("cancel_all: epoll_ctl DEL on fd {} failed: {}", fd, io::Error::last_os_error());
                }
                let r = state.read.take();
                let w = state.write.take();
                let removed = r.is_some() as usize + w.is_some() as usize;
                self.pending_event_count.fetch_sub(removed, Ordering::SeqCst);
                state.events = 0;
                (r, w, true)
            }
        };
        self.fire_continuation(read);
        self.fire_continuation(write);
        had_any
    }

    fn update_epoll_after_clear(&self, fd: RawFd, state: &mut SlotState, event: Event) {
        let remaining = state.events & !event.bits();
        let rc = if remaining == 0 {
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) }
        } else {
            let mut ev = libc::epoll_event {
                events: remaining | (libc::EPOLLET as u32),
                u64: fd as u64,
            };
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) }
        };
        if rc != 0 {
            warn!("epoll_ctl update on fd {} failed: {}", fd, io::Error::last_os_error());
        }
        state.events = remaining;
    }

    fn fire_continuation(&self, cont: Option<Continuation>) {
        match cont {
            None => {}
            Some(Continuation::Callback(cb)) => self.scheduler.schedule(cb),
            Some(Continuation::Sink(sink)) => scheduler::fire_park_sink(&sink, &self.scheduler),
        }
    }

    fn fire_ready(&self, fd: RawFd, real_bits: u32) {
        let slots = self.slots.read();
        if fd as usize >= slots.len() {
            return;
        }
        let slot = &slots[fd as usize];
        let mut fired = Vec::new();
        {
            let mut state = slot.state.lock();
            let masked = real_bits & state.events;
            if masked == 0 {
                return;
            }
            for event in [Event::READ, Event::WRITE] {
                if masked & event.bits() != 0 {
                    self.update_epoll_after_clear(fd, &mut state, event);
                    if let Some(c) = state.slot_mut(event).take() {
                        fired.push(c);
                        self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        }
        for c in fired {
            self.fire_continuation(Some(c));
        }
    }

    /// One pass of the readiness loop: run by [`IdleHook::idle_pass`], i.e.
    /// from inside this thread's per-worker idle coroutine.
    fn idle_pass_impl(&self) {
        let wait_ms = self.timers.next_timeout_ms().min(MAX_WAIT_MS);

        let mut events: [libc::epoll_event; 64] = unsafe { mem::zeroed() };
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, wait_ms as i32)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("epoll_wait failed: {}", err);
                break 0;
            }
            break rc;
        };

        let mut expired = Vec::new();
        self.timers.drain_expired(&mut expired);
        for mut cb in expired {
            cb();
        }

        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if fd == self.tickle_read {
                trace!("io_loop: tickled");
                self.drain_tickle();
                continue;
            }
            let mut bits = 0u32;
            if ev.events & (libc::EPOLLIN as u32) != 0 {
                bits |= Event::READ.bits();
            }
            if ev.events & (libc::EPOLLOUT as u32) != 0 {
                bits |= Event::WRITE.bits();
            }
            if ev.events & ((libc::EPOLLHUP | libc::EPOLLERR) as u32) != 0 {
                bits |= Event::READ.bits() | Event::WRITE.bits();
            }
            if bits != 0 {
                self.fire_ready(fd, bits);
            }
        }
    }

    pub fn add_timer(&self, ms: Millis, callback: impl FnMut() + Send + 'static, recurring: bool) -> TimerHandle {
        self.timers.add_timer(ms, callback, recurring)
    }

    pub fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.scheduler.stop();
        unsafe {
            libc::close(self.tickle_read);
            libc::close(self.tickle_write);
            libc::close(self.epoll_fd);
        }
    }
}

impl IdleHook for IoLoop {
    fn idle_pass(&self, _scheduler: &Scheduler) {
        self.idle_pass_impl();
    }

    fn tickle(&self, _scheduler: &Scheduler) {
        self.tickle_raw();
    }

    fn extra_stopping(&self, _scheduler: &Scheduler) -> bool {
        self.pending_event_count() == 0 && !self.timers.has_timer()
    }

    fn on_worker_start(&self, _worker: usize) {
        CURRENT_IO_LOOP.with(|c| c.set(self as *const IoLoop));
        crate::hooks::set_hook_enabled(true);
    }

    // park_or_requeue: the trait default is sufficient here. `add_event`
    // registers a `ParkSink` via `scheduler::set_pending_park_sink` before
    // the coroutine yields, and `fire_continuation` resolves that same sink
    // through `scheduler::fire_park_sink` when the fd becomes ready.
}

/// Park the currently running coroutine on `event` for `fd`, returning once
/// it fires (naturally, or because a caller's timeout cancelled it).
pub fn wait_for_event(io_loop: &IoLoop, fd: RawFd, event: Event) -> Result<()> {
    io_loop.add_event(fd, event, None)?;
    coroutine::yield_now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::time::Duration;

    #[test]
    fn tickle_wakes_idle_pass() {
        let io_loop = IoLoop::new(1, false, "test-io-loop");
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        io_loop.add_timer(10, move || { f2.fetch_add(1, O::SeqCst); }, false);
        std::thread::sleep(Duration::from_millis(100));
        io_loop.stop();
        assert_eq!(fired.load(O::SeqCst), 1);
    }
}
