//! Client input event kinds.

use serde_json::Value;

/// Kind of a client input event; unknown codes are kept as `Custom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputEventKind {
    Click,
    Change,
    Submit,
    Reset,
    Focus,
    Blur,
    Custom(i64),
}

impl InputEventKind {
    pub fn code(self) -> i64 {
        match self {
            InputEventKind::Click => 301,
            InputEventKind::Change => 302,
            InputEventKind::Submit => 303,
            InputEventKind::Reset => 304,
            InputEventKind::Focus => 305,
            InputEventKind::Blur => 306,
            InputEventKind::Custom(code) => code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            301 => InputEventKind::Click,
            302 => InputEventKind::Change,
            303 => InputEventKind::Submit,
            304 => InputEventKind::Reset,
            305 => InputEventKind::Focus,
            306 => InputEventKind::Blur,
            other => InputEventKind::Custom(other),
        }
    }

    pub fn to_wire(self) -> Value {
        Value::from(self.code())
    }
}

/// Attribute holding a node's event subscriptions as comma separated codes.
pub const EVENTS_ATTRIBUTE: &str = "data-tether-events";

pub(crate) fn parse_events(raw: &str) -> Vec<InputEventKind> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .map(InputEventKind::from_code)
        .collect()
}

pub(crate) fn format_events(events: &[InputEventKind]) -> String {
    events
        .iter()
        .map(|e| e.code().to_string())
        .collect::<Vec<_>>()
        .join(",")
}
