use dispatch_stage::UiSurface;

/// One display mutation, in the order the loop performed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Busy(bool),
    TriggerEnabled(bool),
    FieldA(String),
    FieldB(String),
    Notice(String),
}

#[derive(Default)]
pub struct RecordingUi {
    pub events: Vec<Event>,
}

impl UiSurface for RecordingUi {
    fn set_busy(&mut self, busy: bool) {
        self.events.push(Event::Busy(busy));
    }

    fn set_trigger_enabled(&mut self, enabled: bool) {
        self.events.push(Event::TriggerEnabled(enabled));
    }

    fn set_field_a(&mut self, value: &str) {
        self.events.push(Event::FieldA(value.to_string()));
    }

    fn set_field_b(&mut self, value: &str) {
        self.events.push(Event::FieldB(value.to_string()));
    }

    fn show_transient_notice(&mut self, message: &str) {
        self.events.push(Event::Notice(message.to_string()));
    }
}

/// The display sequence every chain form must produce for one run.
pub fn expected_run() -> Vec<Event> {
    vec![
        Event::Busy(true),
        Event::TriggerEnabled(false),
        Event::FieldA("Moscow".to_string()),
        Event::Notice("loading temperature for Moscow".to_string()),
        Event::FieldB("17".to_string()),
        Event::Busy(false),
        Event::TriggerEnabled(true),
    ]
}
