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

//! Process-wide file-descriptor bookkeeping for the syscall hooks.
//!
//! Grounded on `fdmanager.h`/`fdmanager.cpp` in the original implementation:
//! `FdCtx` tracks whether an fd is a socket, whether the user or the system
//! forced it non-blocking, and the recv/send timeouts the hooks consult;
//! `FdManager` is a singleton vector grown 1.5x and guarded by a
//! reader-writer lock. Reworked here with `parking_lot::RwLock` in place of
//! the original's own `RWMutex`, matching the rest of this crate's lock
//! choice.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc::{S_IFMT, S_IFSOCK};
use log::trace;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config;

/// Which deadline a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

#[derive(Debug)]
pub struct FdEntry {
    is_socket: bool,
    is_closed: AtomicBool,
    /// The application asked for O_NONBLOCK / FIONBIO itself.
    user_nonblock: AtomicBool,
    /// We forced O_NONBLOCK at the kernel level so the hooks can poll it.
    system_nonblock: AtomicBool,
    recv_timeout_ms: Mutex<u64>,
    send_timeout_ms: Mutex<u64>,
}

impl FdEntry {
    fn new(is_socket: bool) -> FdEntry {
        FdEntry {
            is_socket,
            is_closed: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            system_nonblock: AtomicBool::new(is_socket),
            recv_timeout_ms: Mutex::new(config::INFINITE_TIMEOUT),
            send_timeout_ms: Mutex::new(config::INFINITE_TIMEOUT),
        }
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::SeqCst);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn system_nonblock(&self) -> bool {
        self.system_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn set_system_nonblock(&self, v: bool) {
        self.system_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => *self.recv_timeout_ms.lock(),
            TimeoutKind::Send => *self.send_timeout_ms.lock(),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => *self.recv_timeout_ms.lock() = ms,
            TimeoutKind::Send => *self.send_timeout_ms.lock() = ms,
        }
    }
}

/// Process-wide table of [`FdEntry`] indexed by raw fd, grown as needed.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdRegistry {
    pub fn new() -> FdRegistry {
        FdRegistry {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Look up `fd`, optionally creating (and growing the table for) a fresh
    /// entry if none exists yet. Returns `None` for negative fds.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read();
            if idx < slots.len() {
                if let Some(entry) = &slots[idx] {
                    return Some(entry.clone());
                } else if !auto_create {
                    return None;
                }
            } else if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let new_len = ((idx as f64 + 1.0) * 1.5) as usize;
            slots.resize_with(new_len.max(idx + 1), || None);
        }
        if slots[idx].is_none() {
            let is_socket = is_socket_fd(fd);
            if is_socket {
                force_nonblocking(fd);
            }
            let entry = Arc::new(FdEntry::new(is_socket));
            trace!("fd {} registered (socket={})", fd, entry.is_socket);
            slots[idx] = Some(entry);
        }
        slots[idx].clone()
    }

    /// Called from hooked `close`: drop the entry (marking whatever strong
    /// references remain as `is_closed` is the caller's job via
    /// `cancel_all`, this just removes it from the table).
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let idx = fd as usize;
        let mut slots = self.slots.write();
        if idx < slots.len() {
            slots[idx] = None;
        }
    }

    pub fn set_timeout(&self, fd: RawFd, kind: TimeoutKind, ms: u64) {
        if let Some(entry) = self.get(fd, true) {
            entry.set_timeout_ms(kind, ms);
        }
    }

    pub fn get_timeout(&self, fd: RawFd, kind: TimeoutKind) -> u64 {
        self.get(fd, false)
            .map(|e| e.timeout_ms(kind))
            .unwrap_or(config::INFINITE_TIMEOUT)
    }
}

impl Default for FdRegistry {
    fn default() -> FdRegistry {
        FdRegistry::new()
    }
}

fn is_socket_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    rc == 0 && (stat.st_mode & S_IFMT) == S_IFSOCK
}

/// Force O_NONBLOCK on the real kernel fd so a blocking syscall on it
/// returns EAGAIN instead of parking the whole OS thread.
fn force_nonblocking(fd: RawFd) {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return;
    }
    if flags & libc::O_NONBLOCK != 0 {
        return;
    }
    unsafe {
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

static REGISTRY: once_cell::sync::Lazy<FdRegistry> = once_cell::sync::Lazy::new(FdRegistry::new);

/// The process-wide [`FdRegistry`] instance the hooks consult.
pub fn registry() -> &'static FdRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_without_auto_create_returns_none() {
        let reg = FdRegistry::new();
        assert!(reg.get(3, false).is_none());
    }

    #[test]
    fn get_auto_create_grows_and_persists() {
        let reg = FdRegistry::new();
        let e1 = reg.get(5, true).unwrap();
        let e2 = reg.get(5, false).unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[test]
    fn negative_fd_is_none() {
        let reg = FdRegistry::new();
        assert!(reg.get(-1, true).is_none());
    }

    #[test]
    fn remove_clears_slot() {
        let reg = FdRegistry::new();
        reg.get(2, true);
        reg.remove(2);
        assert!(reg.get(2, false).is_none());
    }

    #[test]
    fn timeouts_default_infinite() {
        let reg = FdRegistry::new();
        assert_eq!(reg.get_timeout(7, TimeoutKind::Recv), config::INFINITE_TIMEOUT);
        reg.set_timeout(7, TimeoutKind::Recv, 100);
        assert_eq!(reg.get_timeout(7, TimeoutKind::Recv), 100);
    }
}
