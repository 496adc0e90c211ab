use dispatch_stage::{Completion, GetTimeoutResult, Stage, TryResult};
use std::io;
use std::thread;
use std::time::Duration;

#[test]
fn test() {
    let stage = Stage::new();
    assert!(!stage.completed());
    assert_eq!(None, stage.complete_with_value(5));
    assert!(stage.completed());
    assert_eq!(Some(5), stage.take());
    assert_eq!(None, stage.take());
    assert_eq!(Some(6), stage.complete_with_value(6));
}

#[test]
fn test2() {
    let stage = Stage::supply_async::<thread::Thread>(|| {
        thread::sleep(Duration::from_millis(20));
        123
    });
    assert_eq!(123, stage.get_timeout(Duration::from_millis(5000)).unwrap());
}

#[test]
fn test3() {
    let stage: Stage<()> = Stage::supply_async::<thread::Thread>(|| {
        panic!("supplier blew up");
    });
    assert!(matches!(
        stage.get_timeout(Duration::from_millis(5000)),
        GetTimeoutResult::Panic
    ));
}

#[test]
fn test4() {
    let stage = Stage::new();
    let received = Stage::new();
    let rcl = received.clone();
    stage.then_run(move |completion| {
        rcl.complete_with_value(completion.unwrap());
    });
    // The second consumer observes Taken right away.
    stage.then_run(|completion| {
        assert!(completion.some().is_none());
    });
    stage.complete_with_value(42);
    assert_eq!(Some(42), received.take());
}

#[test]
fn test5() {
    let stage = Stage::supply_async_with_error::<thread::Builder, io::Error>(|| 7)
        .expect("os failed to spawn a thread");
    assert_eq!(Some(7), stage.take());
}

#[test]
fn test6() {
    let stage = Stage::new_completed_value(1);
    assert!(stage.completed());
    assert!(matches!(
        stage.get_timeout(Duration::ZERO),
        GetTimeoutResult::Value(1)
    ));
    assert!(matches!(
        stage.get_timeout(Duration::ZERO),
        GetTimeoutResult::Taken
    ));
    let pending: Stage<u32> = Stage::new();
    assert!(matches!(
        pending.get_timeout(Duration::from_millis(10)),
        GetTimeoutResult::TimedOut
    ));
    assert!(pending.complete(Completion::Value(2)).is_none());
    assert_eq!(Some(2), pending.take());
}

#[test]
fn test7() {
    let stage = Stage::new();
    assert_eq!(TryResult::WouldBlock, stage.try_take());
    stage.complete_with_value(9);
    assert_eq!(TryResult::Value(9), stage.try_take());
    assert_eq!(TryResult::Taken, stage.try_take());
}
