//! A panicking coroutine terminates cleanly without taking its scheduler
//! or any sibling coroutine down with it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fiberloop::scheduler::Scheduler;

fn main() {
    env_logger::init();

    let sched = Scheduler::new(2, false, "refcount-demo");
    let survived = Arc::new(AtomicUsize::new(0));
    let s2 = survived.clone();

    sched.schedule(|| {
        panic!("this coroutine's own problem, not the scheduler's");
    });
    sched.schedule(move || {
        s2.fetch_add(1, Ordering::SeqCst);
    });

    while survived.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(10));
    }
    sched.stop();
    println!("sibling coroutine completed despite the panic");
}
