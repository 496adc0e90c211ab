use dispatch_stage::{load_with_stages, DispatchLoop, UiSurface};
use std::thread;
use std::time::Duration;

struct ConsoleUi;

impl UiSurface for ConsoleUi {
    fn set_busy(&mut self, busy: bool) {
        println!("[ui] busy: {busy}");
    }

    fn set_trigger_enabled(&mut self, enabled: bool) {
        println!("[ui] trigger enabled: {enabled}");
    }

    fn set_field_a(&mut self, value: &str) {
        println!("[ui] location: {value}");
    }

    fn set_field_b(&mut self, value: &str) {
        println!("[ui] temperature: {value}");
    }

    fn show_transient_notice(&mut self, message: &str) {
        println!("[ui] notice: {message}");
    }
}

fn main() {
    let screen = DispatchLoop::spawn("ui", ConsoleUi).expect("os failed to spawn the loop thread");

    // A linear stage pipeline: supply the city on a worker, resume on the
    // loop, compose the temperature stage, resume on the loop again.
    let chain = load_with_stages::<_, thread::Thread>(&screen.handle(), Duration::from_secs(5));
    let (city, temperature) = chain.unwrap();
    println!("loaded: {temperature} degrees in {city}");

    screen.shutdown();
}
