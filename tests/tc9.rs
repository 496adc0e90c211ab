mod common;

use common::{expected_run, RecordingUi};
use dispatch_stage::{load_with_stages, DispatchLoop};
use std::thread;
use std::time::Duration;

// Stage form, zero latency: same display sequence as the other two forms.
#[test]
fn test() {
    let screen = DispatchLoop::spawn("ui", RecordingUi::default()).unwrap();
    let chain = load_with_stages::<_, thread::Thread>(&screen.handle(), Duration::ZERO);
    assert_eq!(Some(("Moscow".to_string(), 17)), chain.take());
    let ui = screen.shutdown();
    assert_eq!(ui.events, expected_run());
}
