use rumqttc::QoS;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// A sensor stream, named by the last topic segment (lower-cased).  The name
/// doubles as the telemetry log key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Moisture(String),
    WaterLevel(String),
    Other(String),
}

impl Channel {
    /// "esp32/sensor/soilMoisture" → `Moisture("soilmoisture")`.
    pub fn from_topic(topic: &str) -> Self {
        let name = topic.rsplit('/').next().unwrap_or_default().to_lowercase();
        if name.contains("soil") {
            Self::Moisture(name)
        } else if name.contains("water") {
            Self::WaterLevel(name)
        } else {
            Self::Other(name)
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Moisture(n) | Self::WaterLevel(n) | Self::Other(n) => n,
        }
    }

    pub fn is_moisture(&self) -> bool {
        matches!(self, Self::Moisture(_))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("payload is not json: {0}")]
    NotJson(String),
    #[error("payload is not a single-key json object")]
    NotObject,
}

/// Decode a payload as text, replacing invalid UTF-8 and trimming whitespace.
pub fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_string()
}

/// Extract the value of a `{"<name>": <value>}` payload.  If the sender
/// included more than one key, the lexically first one wins.
pub fn parse_payload(payload: &[u8]) -> Result<Value, PayloadError> {
    let text = payload_text(payload);
    let parsed: Value =
        serde_json::from_str(&text).map_err(|e| PayloadError::NotJson(e.to_string()))?;
    match parsed {
        Value::Object(map) => map
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .ok_or(PayloadError::NotObject),
        _ => Err(PayloadError::NotObject),
    }
}

/// Map a numeric QoS level from config onto rumqttc's enum.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
