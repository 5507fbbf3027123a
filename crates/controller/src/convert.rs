//! Raw ADC → percent conversion for the recognized sensor channels.
//!
//! Soil moisture is inverted (a capacitive probe reads *higher* when the soil
//! is drier), water level is direct.  Out-of-range readings are clamped, never
//! rejected.

use serde_json::Value;
use thiserror::Error;

use crate::config::{Bounds, SoilCalibration};
use crate::mqtt::Channel;

#[derive(Debug, Error, PartialEq)]
pub enum ConversionError {
    #[error("value {0} is not numeric")]
    NotNumeric(String),
}

/// Map `raw` onto `[0, 100]` using the `low`/`high` calibration endpoints.
///
/// `raw` is clamped into `[min(low, high), max(low, high)]` first.  With
/// `invert` the percent falls as the raw value rises:
/// `(high - clamped) * 100 / (high - low)`; otherwise
/// `(clamped - low) * 100 / (high - low)`.  Rounded to one decimal.
pub fn to_percent(raw: f64, low: f64, high: f64, invert: bool) -> f64 {
    let range = high - low;
    if range == 0.0 {
        return 0.0; // zero-width calibration
    }
    let clamped = raw.clamp(low.min(high), low.max(high));
    let pct = if invert {
        (high - clamped) * 100.0 / range
    } else {
        (clamped - low) * 100.0 / range
    };
    round1(pct)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub fn soil_percent(raw: f64, cal: &SoilCalibration) -> f64 {
    to_percent(raw, cal.wet as f64, cal.dry as f64, true)
}

pub fn water_percent(raw: f64, bounds: &Bounds) -> f64 {
    to_percent(raw, bounds.min as f64, bounds.max as f64, false)
}

/// Interpret a payload value as a number.  JSON numbers and numeric strings
/// are accepted.
pub fn numeric(value: &Value) -> Result<f64, ConversionError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ConversionError::NotNumeric(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ConversionError::NotNumeric(format!("{s:?}"))),
        other => Err(ConversionError::NotNumeric(other.to_string())),
    }
}

/// Normalize `raw` for `channel`.  `Ok(None)` for channels without a
/// conversion (their value is stored as received).
pub fn normalize(
    channel: &Channel,
    raw: &Value,
    soil: &SoilCalibration,
    water: &Bounds,
) -> Result<Option<f64>, ConversionError> {
    match channel {
        Channel::Moisture(_) => Ok(Some(soil_percent(numeric(raw)?, soil))),
        Channel::WaterLevel(_) => Ok(Some(water_percent(numeric(raw)?, water))),
        Channel::Other(_) => Ok(None),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
