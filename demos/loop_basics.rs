use dispatch_stage::{DispatchLoop, Handle, Stage};
use std::thread;
use std::time::Duration;

// Bare use of the message loop, without any fetch chain on top.
fn main() {
    let lp = DispatchLoop::spawn("demo", Vec::<String>::new())
        .expect("os failed to spawn the loop thread");
    let handle = lp.handle();

    handle.post(|log| log.push("immediate post".to_string()));
    handle.post_delayed(
        |log| log.push("delayed post, one second later".to_string()),
        Duration::from_secs(1),
    );

    // From inside the loop the current handle is available...
    let sync = Stage::new();
    let scl = sync.clone();
    handle.post_delayed(
        move |log| {
            let own = Handle::<Vec<String>>::current().expect("loop thread must have a queue");
            own.post(move |log| {
                log.push("re-posted through the current handle".to_string());
                scl.complete_with_value(());
            });
            log.push("asked for the current handle on the loop".to_string());
        },
        Duration::from_secs(2),
    );
    sync.take();

    // ...but a plain worker thread has no queue to receive posts.
    let err = thread::spawn(|| Handle::<Vec<String>>::current().unwrap_err())
        .join()
        .expect("worker panicked");
    println!("off-loop lookup failed as expected: {err}");

    for line in lp.shutdown() {
        println!("{line}");
    }
}
