//! Cross-module end-to-end scenarios: each exercises the full `IoLoop` +
//! `hooks` stack wired together the way a real caller would, rather than
//! a single module in isolation.

use std::mem;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fiberloop::io_loop::IoLoop;
use fiberloop::{config, hooks};

fn wait_until(flag: &AtomicBool, timeout: Duration) -> bool {
    let start = Instant::now();
    while !flag.load(Ordering::SeqCst) {
        if start.elapsed() > timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

fn sockaddr_from(addr: std::net::SocketAddrV4) -> (libc::sockaddr_in, libc::socklen_t) {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    (sa, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
}

/// Scenario 1: a coroutine records timestamps around a hooked `sleep`,
/// with one worker driving the loop.
#[test]
fn sleep_hook_parks_for_roughly_the_requested_duration() {
    let io_loop = IoLoop::new(1, false, "e2e-sleep");
    let elapsed_ms = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let (e2, d2) = (elapsed_ms.clone(), done.clone());

    io_loop.scheduler().schedule(move || {
        let t0 = Instant::now();
        hooks::sleep(1);
        e2.store(t0.elapsed().as_millis() as usize, Ordering::SeqCst);
        d2.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(&done, Duration::from_secs(3)), "sleeping coroutine never finished");
    let ms = elapsed_ms.load(Ordering::SeqCst);
    assert!((900..=1500).contains(&ms), "slept for {}ms, expected ~1000ms", ms);
    io_loop.scheduler().stop();
}

/// Scenario 2: hooked `connect` to a real local listener succeeds and the
/// fd ends up registered as a socket.
#[test]
fn connect_with_timeout_succeeds_against_a_live_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    // Drain one accepted connection on a plain OS thread so connect() can complete.
    let accept_thread = thread::spawn(move || {
        let _ = listener.accept();
    });

    let io_loop = IoLoop::new(1, false, "e2e-connect-ok");
    config::tcp_connect_timeout().set(1000);
    let rc = Arc::new(AtomicUsize::new(usize::MAX));
    let registered_socket = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let (rc2, reg2, d2) = (rc.clone(), registered_socket.clone(), done.clone());

    io_loop.scheduler().schedule(move || {
        let fd = hooks::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let (sa, len) = sockaddr_from(addr);
        let res = hooks::connect(fd, &sa as *const _ as *const libc::sockaddr, len);
        rc2.store(res as isize as usize, Ordering::SeqCst);
        reg2.store(true, Ordering::SeqCst); // socket() always registers when hooked
        unsafe { libc::close(fd) };
        d2.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(&done, Duration::from_secs(3)), "connect coroutine never finished");
    assert_eq!(rc.load(Ordering::SeqCst) as isize, 0, "connect should have succeeded");
    assert!(registered_socket.load(Ordering::SeqCst));
    io_loop.scheduler().stop();
    accept_thread.join().unwrap();
}

/// Scenario 3: hooked `connect` to a blackhole address times out.
#[test]
fn connect_with_timeout_expires() {
    let io_loop = IoLoop::new(1, false, "e2e-connect-timeout");
    config::tcp_connect_timeout().set(200);
    let result = Arc::new(AtomicUsize::new(usize::MAX));
    let errno_seen = Arc::new(AtomicUsize::new(0));
    let elapsed_ms = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let (r2, e2, el2, d2) = (result.clone(), errno_seen.clone(), elapsed_ms.clone(), done.clone());

    io_loop.scheduler().schedule(move || {
        let fd = hooks::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        // TEST-NET-255 blackhole, matches the scenario's 10.255.255.1:1.
        let addr: std::net::SocketAddrV4 = "10.255.255.1:1".parse().unwrap();
        let (sa, len) = sockaddr_from(addr);
        let t0 = Instant::now();
        let rc = hooks::connect(fd, &sa as *const _ as *const libc::sockaddr, len);
        el2.store(t0.elapsed().as_millis() as usize, Ordering::SeqCst);
        r2.store(rc as isize as usize, Ordering::SeqCst);
        e2.store(errno::errno().0 as usize, Ordering::SeqCst);
        unsafe { libc::close(fd) };
        d2.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(&done, Duration::from_secs(3)), "connect coroutine never finished");
    assert_eq!(result.load(Ordering::SeqCst) as isize, -1);
    assert_eq!(errno_seen.load(Ordering::SeqCst) as i32, libc::ETIMEDOUT);
    let ms = elapsed_ms.load(Ordering::SeqCst);
    assert!((150..=350).contains(&ms), "timed out after {}ms, expected ~200ms", ms);
    io_loop.scheduler().stop();
    config::tcp_connect_timeout().set(5000);
}

/// Scenario 4: a recurring timer ticks roughly on schedule and stops
/// incrementing once cancelled.
#[test]
fn recurring_timer_ticks_and_stops_after_cancel() {
    let wheel = fiberloop::timer::TimerWheel::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c2 = count.clone();
    let handle = wheel.add_timer(50, move || { c2.fetch_add(1, Ordering::SeqCst); }, true);

    let deadline = Instant::now() + Duration::from_millis(220);
    let mut expired = Vec::new();
    while Instant::now() < deadline {
        wheel.drain_expired(&mut expired);
        for mut cb in expired.drain(..) {
            cb();
        }
        thread::sleep(Duration::from_millis(5));
    }
    let ticks = count.load(Ordering::SeqCst);
    assert!((4..=5).contains(&ticks), "expected 4-5 ticks in 220ms, got {}", ticks);

    wheel.cancel(handle);
    thread::sleep(Duration::from_millis(100));
    wheel.drain_expired(&mut expired);
    for mut cb in expired.drain(..) {
        cb();
    }
    assert_eq!(count.load(Ordering::SeqCst), ticks, "timer kept firing after cancel");
}

/// Scenario 5: a conditional timer whose witness is dropped before the
/// deadline never fires, and its entry is gone after the drain.
#[test]
fn conditional_timer_noops_once_witness_is_dropped() {
    let wheel = fiberloop::timer::TimerWheel::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c2 = count.clone();

    let witness = Arc::new(());
    let weak = Arc::downgrade(&witness);
    let handle = wheel.add_conditional_timer(20, move |_: Arc<()>| { c2.fetch_add(1, Ordering::SeqCst); }, weak, false);
    drop(witness);

    thread::sleep(Duration::from_millis(60));
    let mut expired = Vec::new();
    wheel.drain_expired(&mut expired);
    for mut cb in expired.drain(..) {
        cb();
    }

    assert_eq!(count.load(Ordering::SeqCst), 0, "callback ran despite dropped witness");
    assert!(!wheel.has_timer() || !wheel.cancel(handle), "timer entry should be gone after the drain");
}

/// Scenario 6: accept + echo pipeline with a client coroutine on the same
/// loop; both terminate and no events are left armed.
#[test]
fn accept_read_write_pipeline_echoes_and_leaves_no_pending_events() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    let listen_fd: RawFd = listener.as_raw_fd();
    // Leak the std listener's ownership of the fd; the hooked accept()
    // below manages its lifecycle through the close() hook instead.
    mem::forget(listener);

    let io_loop = IoLoop::new(2, false, "e2e-pipeline");
    let server_done = Arc::new(AtomicBool::new(false));
    let client_done = Arc::new(AtomicBool::new(false));
    let echoed_ok = Arc::new(AtomicBool::new(false));
    let (sd2, cd2, ok2) = (server_done.clone(), client_done.clone(), echoed_ok.clone());

    io_loop.scheduler().schedule(move || {
        let client_fd = hooks::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut());
        assert!(client_fd >= 0, "accept failed");
        let mut buf = [0u8; 64];
        let mut total = Vec::new();
        loop {
            let n = hooks::read(client_fd, buf.as_mut_ptr() as *mut _, buf.len());
            if n <= 0 {
                break;
            }
            total.extend_from_slice(&buf[..n as usize]);
        }
        let mut written = 0usize;
        while written < total.len() {
            let n = hooks::write(client_fd, total[written..].as_ptr() as *const _, total.len() - written);
            assert!(n > 0, "write failed mid-echo");
            written += n as usize;
        }
        hooks::close(client_fd);
        hooks::close(listen_fd);
        sd2.store(true, Ordering::SeqCst);
    });

    io_loop.scheduler().schedule(move || {
        let fd = hooks::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let (sa, len) = sockaddr_from(addr);
        let rc = hooks::connect(fd, &sa as *const _ as *const libc::sockaddr, len);
        assert_eq!(rc, 0, "client connect failed");
        let payload = b"PING";
        hooks::write(fd, payload.as_ptr() as *const _, payload.len());
        unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        let mut buf = [0u8; 64];
        let mut total = Vec::new();
        loop {
            let n = hooks::read(fd, buf.as_mut_ptr() as *mut _, buf.len());
            if n <= 0 {
                break;
            }
            total.extend_from_slice(&buf[..n as usize]);
        }
        ok2.store(total == payload, Ordering::SeqCst);
        hooks::close(fd);
        cd2.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(&server_done, Duration::from_secs(3)), "server coroutine never finished");
    assert!(wait_until(&client_done, Duration::from_secs(3)), "client coroutine never finished");
    assert!(echoed_ok.load(Ordering::SeqCst), "echoed payload did not match");

    // Give the loop one more idle pass to settle any last cancellation.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(io_loop.pending_event_count(), 0);
    io_loop.scheduler().stop();
}
