//! A conditional timer that auto-cancels once its witness is dropped,
//! versus one that fires normally.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fiberloop::timer::TimerWheel;

fn main() {
    env_logger::init();

    let wheel = TimerWheel::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let witness = Arc::new(());
    let weak = Arc::downgrade(&witness);
    let f1 = fired.clone();
    wheel.add_conditional_timer(10, move |_| { f1.fetch_add(1, Ordering::SeqCst); }, weak, false);
    drop(witness); // the timer above will now no-op when it fires

    let f2 = fired.clone();
    wheel.add_timer(10, move || { f2.fetch_add(1, Ordering::SeqCst); }, false);

    thread::sleep(Duration::from_millis(30));
    let mut expired = Vec::new();
    wheel.drain_expired(&mut expired);
    for mut cb in expired {
        cb();
    }

    println!("fired: {} (expected 1 — the conditional timer's witness was dropped)", fired.load(Ordering::SeqCst));
}
