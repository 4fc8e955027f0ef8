//! Bare coroutine resume/yield, no scheduler involved.

fn main() {
    env_logger::init();

    let mut coro = fiberloop::spawn(move || {
        println!("1. Hello in coroutine!");
        fiberloop::yield_now();
        println!("3. We are back!!");

        let mut inner = fiberloop::spawn(move || {
            println!("4. Begin counting ...");
            for i in 0..5 {
                println!("Counting {}", i);
            }
            println!("5. Counting finished");
        });
        fiberloop::coroutine::resume(&mut inner);

        println!("6. Good bye");
    });

    fiberloop::coroutine::resume(&mut coro);
    println!("2. We are here!");
    fiberloop::coroutine::resume(&mut coro);
    println!("7. Back to main.");
}
