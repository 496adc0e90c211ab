mod common;

use common::{expected_run, RecordingUi};
use dispatch_stage::{advance, load_with_steps, DispatchLoop, Step, StepEvent};
use std::thread;
use std::time::Duration;

// Step form, zero latency: same display sequence as the callback form.
#[test]
fn test() {
    let screen = DispatchLoop::spawn("ui", RecordingUi::default()).unwrap();
    let chain = load_with_steps(&screen.handle(), Duration::ZERO);
    assert_eq!(Some(("Moscow".to_string(), 17)), chain.take());
    let ui = screen.shutdown();
    assert_eq!(ui.events, expected_run());
}

// The transition function only accepts the pairs a run can produce.
#[test]
fn test2() {
    let step = advance(Step::FetchingA, StepEvent::CityLoaded("Moscow".to_string()));
    assert_eq!(step, Step::HaveA("Moscow".to_string()));

    let step = advance(
        Step::FetchingB("Moscow".to_string()),
        StepEvent::TemperatureLoaded(17),
    );
    assert_eq!(step, Step::Done("Moscow".to_string(), 17));
}

#[test]
fn test3() {
    let tmp = thread::spawn(|| advance(Step::FetchingA, StepEvent::TemperatureLoaded(17)))
        .join()
        .unwrap_err();
    let msg = tmp.downcast::<String>().unwrap();
    assert!(msg.contains("invalid transition"));
}
