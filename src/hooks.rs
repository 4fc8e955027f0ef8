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

//! Coroutine-aware replacements for the blocking POSIX calls a fiber would
//! otherwise stall a whole worker thread on.
//!
//! Grounded on `hook.cpp` in the original implementation: the `HOOK_FUN`
//! table of intercepted names, the `doIO` template (retry loop around a raw
//! non-blocking call, arm an event plus an optional timeout timer on
//! `EAGAIN`, yield, inspect the timer's witness on resume), and the
//! individual per-syscall bodies (`connect_with_timeout`, the `fcntl`
//! F_SETFL/F_GETFL dance, the `setsockopt` SO_RCVTIMEO/SO_SNDTIMEO
//! interception). The original installs these via symbol interposition
//! (`dlsym(RTLD_NEXT, ...)` behind macros); this crate exposes them as
//! plain functions under this module's namespace instead, since Rust has no
//! equivalent dynamic-linker hook point.

use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::config;
use crate::coroutine;
use crate::fd::{self, TimeoutKind};
use crate::io_loop::{self, Event, IoLoop};
use crate::scheduler::{self, ParkSink, ParkState};
use crate::timer::{Millis, TimerHandle};

thread_local! {
    static HOOK_ENABLED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// Enable or disable hooking on the calling thread. Scheduler workers turn
/// this on in their run loop; a thread that never calls this sees raw libc
/// behavior from every function in this module.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

fn set_errno(err: i32) {
    errno::set_errno(errno::Errno(err));
}

fn get_errno() -> i32 {
    errno::errno().0
}

/// The shared witness a conditional timeout timer and the parked coroutine
/// both observe, to distinguish "woke up because the fd is ready" from
/// "woke up because the timer fired first". Mirrors `TimerInfo` in the
/// original.
struct TimerInfo {
    timed_out: AtomicBool,
}

impl TimerInfo {
    fn new() -> TimerInfo {
        TimerInfo { timed_out: AtomicBool::new(false) }
    }

    fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

/// Arm a conditional timer that cancels `event` on `fd` if it fires before
/// the fd becomes ready. Returns the witness the caller checks after
/// waking, plus the timer handle to cancel if the fd won the race instead.
fn arm_timeout(io_loop: &'static IoLoop, fd: RawFd, event: Event, ms: Millis) -> (Arc<TimerInfo>, TimerHandle) {
    let info = Arc::new(TimerInfo::new());
    let witness = Arc::downgrade(&info);
    let handle = io_loop.timers().add_conditional_timer(
        ms,
        move |info: Arc<TimerInfo>| {
            info.mark_timed_out();
            io_loop.cancel_event(fd, event);
        },
        witness,
        false,
    );
    (info, handle)
}

/// The generic retry/park loop every blocking I/O hook goes through.
/// Mirrors `doIO` in the original: fall back to the raw call whenever
/// hooking isn't in play (hooks disabled, fd untracked or not a socket, or
/// the caller asked for raw non-blocking semantics itself), otherwise retry
/// across `EINTR`, and on `EAGAIN` park the coroutine on `event` (with an
/// optional timeout) until it is ready to retry.
fn do_io<F>(fd: RawFd, event: Event, timeout_kind: Option<TimeoutKind>, name: &str, mut op: F) -> isize
where
    F: FnMut() -> isize,
{
    if !hook_enabled() {
        return op();
    }
    let entry = match fd::registry().get(fd, false) {
        Some(e) => e,
        None => return op(),
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return op();
    }
    let Some(io_loop) = io_loop::current() else {
        return op();
    };
    let timeout_ms = timeout_kind
        .map(|k| fd::registry().get_timeout(fd, k))
        .unwrap_or(config::INFINITE_TIMEOUT);

    loop {
        let rc = op();
        if rc != -1 {
            return rc;
        }
        let err = get_errno();
        if err == libc::EINTR {
            continue;
        }
        if err != libc::EAGAIN && err != libc::EWOULDBLOCK {
            return rc;
        }

        let timer = if timeout_ms != config::INFINITE_TIMEOUT {
            Some(arm_timeout(io_loop, fd, event, timeout_ms))
        } else {
            None
        };

        if let Err(e) = io_loop.add_event(fd, event, None) {
            warn!("{}: add_event on fd {} failed: {}", name, fd, e);
            if let Some((_, handle)) = timer {
                io_loop.timers().cancel(handle);
            }
            set_errno(libc::EBADF);
            return -1;
        }
        coroutine::yield_now();

        if let Some((info, handle)) = timer {
            io_loop.timers().cancel(handle);
            if info.is_timed_out() {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
        }
    }
}

/// Park the current coroutine for `ms` milliseconds, using the same
/// [`ParkSink`] mechanism `io_loop` uses for fd-event parking (see that
/// module's docs) instead of a dedicated sleep-only path.
fn sleep_ms(ms: Millis) {
    let Some(io_loop) = io_loop::current() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let sink: ParkSink = Arc::new(parking_lot::Mutex::new(ParkState::WaitingForHandle));
    let sched = io_loop.scheduler().clone();
    let fire_sink = sink.clone();
    io_loop.add_timer(
        ms,
        move || scheduler::fire_park_sink(&fire_sink, &sched),
        false,
    );
    scheduler::set_pending_park_sink(sink);
    coroutine::yield_now();
}

pub fn sleep(seconds: u32) -> u32 {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as Millis * 1000);
    0
}

pub fn usleep(usec: u32) -> i32 {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(((usec as u64) + 999) / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec) -> i32 {
    if !hook_enabled() {
        return unsafe { libc::nanosleep(req, std::ptr::null_mut()) };
    }
    let ms = (req.tv_sec.max(0) as u64) * 1000 + (req.tv_nsec.max(0) as u64) / 1_000_000;
    sleep_ms(ms);
    0
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && hook_enabled() {
        fd::registry().get(fd, true);
    }
    fd
}

/// `connect`, with an fd already known non-blocking at the kernel level
/// treated the same as a hooked one (the retry/park shape is identical;
/// only the event direction and the "success" check differ from `do_io`).
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    if !hook_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    fd::registry().get(fd, true);
    let rc = unsafe { libc::connect(fd, addr, addrlen) };
    if rc == 0 {
        return 0;
    }
    if get_errno() != libc::EINPROGRESS {
        return rc;
    }
    let Some(io_loop) = io_loop::current() else {
        return rc;
    };

    let timeout_ms = config::tcp_connect_timeout().get();
    let timer = if timeout_ms != config::INFINITE_TIMEOUT {
        Some(arm_timeout(io_loop, fd, Event::WRITE, timeout_ms))
    } else {
        None
    };
    if let Err(e) = io_loop.add_event(fd, Event::WRITE, None) {
        warn!("connect: add_event on fd {} failed: {}", fd, e);
        if let Some((_, handle)) = timer {
            io_loop.timers().cancel(handle);
        }
        set_errno(libc::EINVAL);
        return -1;
    }
    coroutine::yield_now();

    if let Some((info, handle)) = timer {
        io_loop.timers().cancel(handle);
        if info.is_timed_out() {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
    }

    let mut so_err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_err as *mut libc::c_int as *mut c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return -1;
    }
    if so_err == 0 {
        0
    } else {
        set_errno(so_err);
        -1
    }
}

pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> RawFd {
    let rc = do_io(fd, Event::READ, Some(TimeoutKind::Recv), "accept", || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    }) as RawFd;
    if rc >= 0 && hook_enabled() {
        fd::registry().get(rc, true);
    }
    rc
}

pub fn read(fd: RawFd, buf: *mut c_void, count: usize) -> isize {
    do_io(fd, Event::READ, Some(TimeoutKind::Recv), "read", || unsafe {
        libc::read(fd, buf, count)
    })
}

pub fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, Event::READ, Some(TimeoutKind::Recv), "readv", || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: RawFd, buf: *mut c_void, len: usize, flags: i32) -> isize {
    do_io(fd, Event::READ, Some(TimeoutKind::Recv), "recv", || unsafe {
        libc::recv(fd, buf, len, flags)
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: *mut c_void,
    len: usize,
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, Event::READ, Some(TimeoutKind::Recv), "recvfrom", || unsafe {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

pub fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, Event::READ, Some(TimeoutKind::Recv), "recvmsg", || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: *const c_void, count: usize) -> isize {
    do_io(fd, Event::WRITE, Some(TimeoutKind::Send), "write", || unsafe {
        libc::write(fd, buf, count)
    })
}

pub fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, Event::WRITE, Some(TimeoutKind::Send), "writev", || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: RawFd, buf: *const c_void, len: usize, flags: i32) -> isize {
    do_io(fd, Event::WRITE, Some(TimeoutKind::Send), "send", || unsafe {
        libc::send(fd, buf, len, flags)
    })
}

pub fn sendto(
    fd: RawFd,
    buf: *const c_void,
    len: usize,
    flags: i32,
    dst_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    do_io(fd, Event::WRITE, Some(TimeoutKind::Send), "sendto", || unsafe {
        libc::sendto(fd, buf, len, flags, dst_addr, addrlen)
    })
}

pub fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, Event::WRITE, Some(TimeoutKind::Send), "sendmsg", || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

pub fn close(fd: RawFd) -> i32 {
    if hook_enabled() {
        if let Some(io_loop) = io_loop::current() {
            io_loop.cancel_all(fd);
        }
        fd::registry().remove(fd);
    }
    unsafe { libc::close(fd) }
}

/// Only `F_SETFL`/`F_GETFL` are intercepted (to keep the user-visible
/// non-block flag and the kernel-forced one separate); everything else
/// passes straight through. The original's variadic third argument becomes
/// a plain `i32` here since this isn't real symbol interposition.
pub fn fcntl(fd: RawFd, cmd: i32, arg: i32) -> i32 {
    if !hook_enabled() {
        return unsafe { libc::fcntl(fd, cmd, arg) };
    }
    match cmd {
        libc::F_SETFL => {
            let user_nonblock = arg & libc::O_NONBLOCK != 0;
            if let Some(entry) = fd::registry().get(fd, true) {
                entry.set_user_nonblock(user_nonblock);
                entry.set_system_nonblock(true);
            }
            unsafe { libc::fcntl(fd, libc::F_SETFL, arg | libc::O_NONBLOCK) }
        }
        libc::F_GETFL => {
            let rc = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if rc == -1 {
                return rc;
            }
            match fd::registry().get(fd, false) {
                Some(entry) if entry.system_nonblock() && !entry.user_nonblock() => rc & !libc::O_NONBLOCK,
                _ => rc,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Only `FIONBIO` is intercepted; every other request passes through.
pub fn ioctl(fd: RawFd, request: libc::c_ulong, argp: *mut i32) -> i32 {
    if hook_enabled() && request == libc::FIONBIO as libc::c_ulong {
        let user_nonblock = unsafe { *argp } != 0;
        if let Some(entry) = fd::registry().get(fd, true) {
            entry.set_user_nonblock(user_nonblock);
        }
    }
    unsafe { libc::ioctl(fd, request, argp) }
}

/// Pure passthrough; the original doesn't intercept `getsockopt` either.
pub fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// `SO_RCVTIMEO`/`SO_SNDTIMEO` are additionally recorded in the
/// [`fd::FdRegistry`] so `do_io` knows how long to let a fiber park; the raw
/// `setsockopt` call is always made regardless, so non-hooked paths
/// (threads with hooking disabled) still get real kernel timeouts.
pub fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        let tv = unsafe { &*(optval as *const libc::timeval) };
        let ms = (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000;
        let kind = if optname == libc::SO_RCVTIMEO {
            TimeoutKind::Recv
        } else {
            TimeoutKind::Send
        };
        let ms = if ms == 0 { config::INFINITE_TIMEOUT } else { ms };
        fd::registry().set_timeout(fd, kind, ms);
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_enabled_is_thread_local_and_defaults_off() {
        assert!(!hook_enabled());
        set_hook_enabled(true);
        assert!(hook_enabled());
        set_hook_enabled(false);
    }

    #[test]
    fn raw_passthrough_when_hooks_disabled() {
        set_hook_enabled(false);
        let rc = do_io(-1, Event::READ, None, "test", || -1);
        assert_eq!(rc, -1);
    }
}
