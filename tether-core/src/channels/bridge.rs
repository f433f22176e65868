//! Bus bridge codec: `[issuer, topic, params]` as JSON.

use serde_json::Value;

use crate::error::BusError;

/// Where the broker forwards non-local messages.
pub trait BridgeSink: Send + Sync {
    fn publish(&self, frame: String);
}

pub fn encode(issuer: &str, topic: &str, params: &Value) -> Result<String, BusError> {
    serde_json::to_string(&(issuer, topic, params)).map_err(|e| BusError::InvalidFrame(e.to_string()))
}

/// Anything but a 3-element array with string issuer and topic is rejected.
pub fn decode(frame: &str) -> Result<(String, String, Value), BusError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| BusError::InvalidFrame(e.to_string()))?;
    let Value::Array(mut items) = value else {
        return Err(BusError::InvalidFrame("not an array".to_string()));
    };
    if items.len() != 3 {
        return Err(BusError::InvalidFrame(format!(
            "expected 3 items, got {}",
            items.len()
        )));
    }
    let params = items.pop().unwrap_or(Value::Null);
    let (Value::String(issuer), Value::String(topic)) = (&items[0], &items[1]) else {
        return Err(BusError::InvalidFrame(
            "issuer and topic must be strings".to_string(),
        ));
    };
    Ok((issuer.clone(), topic.clone(), params))
}

/// Sink that collects frames in memory.
#[derive(Default)]
pub struct MemorySink {
    frames: std::sync::Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn frames(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl BridgeSink for MemorySink {
    fn publish(&self, frame: String) {
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(frame);
    }
}
