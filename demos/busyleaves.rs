//! Several coroutines sleeping on the hooked `sleep`, each on its own
//! cadence, driven by one `IoLoop`. Demonstrates that a hooked sleep parks
//! the coroutine (via the same `ParkSink` fd-event parking uses) instead of
//! blocking the worker thread it happens to run on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fiberloop::io_loop::IoLoop;

fn main() {
    env_logger::init();

    let io_loop = IoLoop::new(num_cpus::get().max(2), false, "busyleaves-demo");
    let done = Arc::new(AtomicUsize::new(0));

    for worker in 0..4 {
        let done = done.clone();
        io_loop.scheduler().schedule(move || {
            for count in 0..3 {
                println!("worker {}: counting {}", worker, count);
                fiberloop::hooks::usleep(20_000);
            }
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    while done.load(Ordering::SeqCst) < 4 {
        thread::sleep(Duration::from_millis(20));
    }
    io_loop.stop();
}
