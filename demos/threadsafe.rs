//! Pinning a task to a specific worker with `schedule_to`: every resume of
//! the pinned coroutine happens on the same worker thread, confirmed by
//! comparing `std::thread::current().name()` across yields.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fiberloop::scheduler::Scheduler;

fn main() {
    env_logger::init();

    let sched = Scheduler::new(num_cpus::get().max(2), false, "threadsafe-demo");
    let done = Arc::new(AtomicUsize::new(0));
    let d2 = done.clone();

    sched.schedule_to(0, move || {
        let mut last_name: Option<String> = None;
        for count in 0..100 {
            let name = thread::current().name().map(str::to_owned);
            if let Some(prev) = &last_name {
                assert_eq!(prev, name.as_ref().unwrap(), "pinned task migrated threads");
            }
            last_name = name;
            if count % 20 == 0 {
                println!("pinned task still on {:?}: counting {}", last_name, count);
            }
            fiberloop::yield_now();
        }
        d2.fetch_add(1, Ordering::SeqCst);
    });

    while done.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(10));
    }
    sched.stop();
    println!("pinned task completed without migrating workers");
}
