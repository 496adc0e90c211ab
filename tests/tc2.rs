use dispatch_stage::{DispatchLoop, Stage};
use std::thread;
use std::thread::ThreadId;

// A continuation posted from a worker never executes on the worker, and two
// posts issued from one worker in program order are observed in that order.
#[test]
fn test() {
    let lp = DispatchLoop::spawn("lp", Vec::<(u32, ThreadId)>::new()).unwrap();
    let handle = lp.handle();

    let worker = thread::spawn(move || {
        handle.post(|v| v.push((1, thread::current().id())));
        handle.post(|v| v.push((2, thread::current().id())));
        let sync = Stage::new();
        let scl = sync.clone();
        handle.post(move |_| {
            scl.complete_with_value(());
        });
        sync.take().unwrap();
        thread::current().id()
    });

    let worker_id = worker.join().unwrap();
    let v = lp.shutdown();
    assert_eq!(v.len(), 2);
    assert_eq!(v[0].0, 1);
    assert_eq!(v[1].0, 2);
    assert_eq!(v[0].1, v[1].1);
    assert_ne!(v[0].1, worker_id);
}
