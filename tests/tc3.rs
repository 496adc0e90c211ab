use dispatch_stage::{DispatchLoop, Stage};
use std::time::Duration;

// Delayed posts order by due time, ahead of which an immediate post runs
// first regardless of when it was issued.
#[test]
fn test() {
    let lp = DispatchLoop::spawn("lp", Vec::<&'static str>::new()).unwrap();
    let handle = lp.handle();

    handle.post_delayed(|v| v.push("slow"), Duration::from_millis(120));
    handle.post_delayed(|v| v.push("fast"), Duration::from_millis(40));
    handle.post(|v| v.push("now"));

    let sync = Stage::new();
    let scl = sync.clone();
    handle.post_delayed(
        move |_| {
            scl.complete_with_value(());
        },
        Duration::from_millis(200),
    );
    sync.take().unwrap();

    let v = lp.shutdown();
    assert_eq!(v, vec!["now", "fast", "slow"]);
}

// Two delayed posts with the same delay keep their post order.
#[test]
fn test2() {
    let lp = DispatchLoop::spawn("lp", Vec::<&'static str>::new()).unwrap();
    let handle = lp.handle();

    handle.post_delayed(|v| v.push("first"), Duration::ZERO);
    handle.post_delayed(|v| v.push("second"), Duration::ZERO);

    let v = lp.shutdown();
    assert_eq!(v, vec!["first", "second"]);
}
