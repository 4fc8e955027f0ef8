//! One scheduler, several worker threads, coroutines that yield between
//! counting steps. Order across coroutines is not guaranteed; order within
//! a single coroutine always is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fiberloop::scheduler::Scheduler;

fn main() {
    env_logger::init();

    let n_threads = num_cpus::get();
    let sched = Scheduler::new(n_threads, false, "multithread-demo");
    let remaining = Arc::new(AtomicUsize::new(n_threads));

    for worker in 0..n_threads {
        let remaining = remaining.clone();
        sched.schedule(move || {
            for count in 0..10 {
                println!("coroutine for worker {}: counting {}", worker, count);
                fiberloop::yield_now();
            }
            remaining.fetch_sub(1, Ordering::SeqCst);
        });
    }

    while remaining.load(Ordering::SeqCst) > 0 {
        thread::sleep(Duration::from_millis(20));
    }
    sched.stop();
}
