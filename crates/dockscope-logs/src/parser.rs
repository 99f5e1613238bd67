use std::sync::Arc;

use chrono::DateTime;
use serde_json::Value;

use dockscope_types::{LogEvent, LogMessage, StdType};

use crate::level::LevelClassifier;
use crate::logfmt::parse_logfmt;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Turns raw log lines into typed, leveled records
#[derive(Clone)]
pub struct LogParser {
    levels: Arc<LevelClassifier>,
}

impl LogParser {
    pub fn new(levels: Arc<LevelClassifier>) -> Self {
        Self { levels }
    }

    /// Parse a raw line and classify its level
    pub fn parse(&self, raw: &str, stream: StdType) -> LogEvent {
        let mut event = parse_raw(raw, stream);
        event.level = self.levels.classify(&event.message);
        event
    }
}

/// Parse a raw line without level detection
///
/// Lines are expected as `<RFC3339 timestamp> <payload>`. Lines without a
/// recognizable timestamp pass through unchanged with a timestamp of 0.
pub fn parse_raw(raw: &str, stream: StdType) -> LogEvent {
    let mut event = LogEvent::new(fnv1a32(raw.as_bytes()), raw.to_string(), stream);

    let Some((prefix, rest)) = raw.split_once(' ') else {
        return event;
    };
    let Ok(timestamp) = DateTime::parse_from_rfc3339(prefix) else {
        return event;
    };

    event.timestamp = timestamp.timestamp_millis();

    let payload = rest.trim_end_matches(['\n', '\r']);
    event.raw_message = payload.to_string();
    event.message = parse_payload(payload, &mut event.raw_message);
    event
}

fn parse_payload(payload: &str, raw_message: &mut String) -> LogMessage {
    if payload.is_empty() {
        return LogMessage::Text(String::new());
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(fields)) => return LogMessage::Fields(fields),
        // Indistinguishable from an empty line once collapsed
        Ok(Value::Null) => return LogMessage::Text(String::new()),
        Ok(other) => {
            tracing::debug!(kind = json_kind(&other), "json payload is not an object, keeping text");
            return LogMessage::Text(payload.to_string());
        }
        Err(_) => {}
    }

    match parse_logfmt(payload) {
        Ok(fields) if !fields.is_empty() => {
            if let Ok(compact) = serde_json::to_string(&fields) {
                *raw_message = compact;
            }
            LogMessage::Fields(fields)
        }
        _ => LogMessage::Text(payload.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
