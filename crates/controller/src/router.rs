//! Dispatch of inbound events into conversion, telemetry and the actuator.
//!
//! Both event sources (MQTT messages and manual presses) are handled on the
//! main loop, one at a time, through [`ControllerContext`].  Nothing here
//! returns an error: every per-message failure is logged and the message
//! degrades to a passthrough reading.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::actuator::Actuator;
use crate::config::{Bounds, Config, ControlConfig, SoilCalibration};
use crate::convert;
use crate::mqtt::{self, Channel};
use crate::telemetry::{SensorReading, TelemetryPublisher};

pub const AUTO_REASON: &str = "auto_soil_high";
pub const MANUAL_REASON: &str = "manual_burst";

/// Channel names that may start an automatic burst.  Other `*soil*` channels
/// are still converted but never actuate.
pub const SOIL_TRIGGER_CHANNELS: [&str; 2] = ["soil", "soilmoisture"];

/// Everything the handlers touch, owned by the main loop.
pub struct ControllerContext {
    control: ControlConfig,
    soil: SoilCalibration,
    water: Bounds,
    actuator: Actuator,
    publisher: TelemetryPublisher,
}

impl ControllerContext {
    pub fn new(cfg: &Config, actuator: Actuator, publisher: TelemetryPublisher) -> Self {
        Self {
            control: cfg.control.clone(),
            soil: cfg.soil_calibration.clone(),
            water: cfg.water_level_bounds.clone(),
            actuator,
            publisher,
        }
    }

    pub fn actuator(&self) -> &Actuator {
        &self.actuator
    }

    /// Parse, convert and publish one sensor message, then run the soil
    /// trigger.  Returns the reading that was published.
    pub async fn handle_message(&mut self, topic: &str, payload: &[u8]) -> SensorReading {
        let channel = Channel::from_topic(topic);
        let timestamp = crate::now_ms();

        let parsed = match mqtt::parse_payload(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(topic, "{e}; storing raw payload");
                None
            }
        };

        let reading = match parsed {
            Some(raw) => {
                let normalized = match convert::normalize(&channel, &raw, &self.soil, &self.water) {
                    Ok(pct) => pct,
                    Err(e) => {
                        warn!(channel = %channel, "{e}; storing raw value");
                        None
                    }
                };
                SensorReading {
                    channel,
                    raw,
                    normalized,
                    timestamp,
                }
            }
            None => SensorReading {
                channel,
                raw: Value::String(mqtt::payload_text(payload)),
                normalized: None,
                timestamp,
            },
        };

        debug!(
            channel = %reading.channel,
            raw = %reading.raw,
            normalized = ?reading.normalized,
            "reading"
        );

        if let Err(e) = self.publisher.publish(&reading, self.actuator.snapshot()).await {
            warn!(channel = %reading.channel, "telemetry append failed: {e}");
        }

        if soil_is_high(&reading, self.control.soil_on_threshold) {
            info!(channel = %reading.channel, raw = %reading.raw, "soil reading above threshold");
            self.actuator.activate(AUTO_REASON);
        }

        reading
    }

    /// A debounced press of the manual button.
    pub fn handle_manual_trigger(&self) -> bool {
        info!("manual burst requested");
        let started = self.actuator.activate(MANUAL_REASON);
        if let (false, Some(since)) = (started, self.actuator.activation_ts()) {
            debug!(since, "burst already running; schedule unchanged");
        }
        started
    }
}

/// The soil trigger compares the raw ADC value, strictly above the
/// threshold.  Readings that did not parse or convert never trip it.
fn soil_is_high(reading: &SensorReading, threshold: i64) -> bool {
    if !reading.channel.is_moisture() || reading.normalized.is_none() {
        return false;
    }
    if !SOIL_TRIGGER_CHANNELS.contains(&reading.channel.name()) {
        return false;
    }
    match convert::numeric(&reading.raw) {
        Ok(raw) => raw > threshold as f64,
        Err(_) => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
