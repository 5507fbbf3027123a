//! TOML config file loading and validation.  Every key has a default, so an
//! empty (or missing) file yields the stock controller setup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub control: ControlConfig,
    pub soil_calibration: SoilCalibration,
    pub water_level_bounds: Bounds,
    pub gpio: GpioConfig,
    pub sink: SinkConfig,
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub qos: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Raw soil ADC value above which an automatic burst starts.
    pub soil_on_threshold: i64,
    pub burst_duration_ms: u64,
    pub cooldown_interval_ms: u64,
}

/// Soil probe endpoints in raw ADC units.  `dry` reads higher than `wet`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoilCalibration {
    pub wet: i64,
    pub dry: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub relay_pin: u8,
    pub relay_active_low: bool,
    pub button_pin: u8,
    pub button_debounce_ms: u64,
    pub led_red_pin: u8,
    pub led_green_pin: u8,
    pub led_blue_pin: u8,
    pub led_common_anode: bool,
    pub led_pwm_hz: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Realtime-database base URL.  Empty keeps telemetry in memory.
    pub url: String,
    pub root: String,
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub command: String,
    pub width: u32,
    pub height: u32,
    pub queue_depth: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "irrigation-controller".into(),
            topic: "esp32/sensor/#".into(),
            qos: 1,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            soil_on_threshold: 3500,
            burst_duration_ms: 5000,
            cooldown_interval_ms: 10_000,
        }
    }
}

impl Default for SoilCalibration {
    fn default() -> Self {
        Self { wet: 300, dry: 3500 }
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: ADC_MAX,
        }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            relay_pin: 24,
            relay_active_low: true,
            button_pin: 23,
            button_debounce_ms: 30,
            led_red_pin: 17,
            led_green_pin: 27,
            led_blue_pin: 22,
            led_common_anode: false,
            led_pwm_hz: 1000.0,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            root: "mqtt".into(),
            auth_token: None,
            timeout_ms: 5000,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "rpicam-still".into(),
            width: 1280,
            height: 720,
            queue_depth: 1,
        }
    }
}

impl ControlConfig {
    pub fn burst_duration(&self) -> Duration {
        Duration::from_millis(self.burst_duration_ms)
    }

    pub fn cooldown_interval(&self) -> Duration {
        Duration::from_millis(self.cooldown_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Hardware limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Full scale of the field node's 12-bit ADC.
pub const ADC_MAX: i64 = 4095;

/// Contact bounce on the push button settles well within this.
const MIN_DEBOUNCE_MS: u64 = 30;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_control(&mut errors);
        self.validate_calibration(&mut errors);
        self.validate_gpio(&mut errors);
        self.validate_sink(&mut errors);
        self.validate_camera(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        if m.topic.trim().is_empty() {
            errors.push("mqtt: topic is empty".into());
        }
        if m.qos > 2 {
            errors.push(format!("mqtt: qos {} out of range [0, 2]", m.qos));
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        if !(0..=ADC_MAX).contains(&c.soil_on_threshold) {
            errors.push(format!(
                "control: soil_on_threshold {} out of ADC range [0, {ADC_MAX}]",
                c.soil_on_threshold
            ));
        }
        if c.burst_duration_ms == 0 {
            errors.push("control: burst_duration_ms must be positive".into());
        }
        if c.cooldown_interval_ms == 0 {
            errors.push("control: cooldown_interval_ms must be positive".into());
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        let s = &self.soil_calibration;
        for (name, v) in [("wet", s.wet), ("dry", s.dry)] {
            if !(0..=ADC_MAX).contains(&v) {
                errors.push(format!(
                    "soil_calibration: {name} {v} out of ADC range [0, {ADC_MAX}]"
                ));
            }
        }
        if s.wet == s.dry {
            errors.push(format!(
                "soil_calibration: wet and dry are both {} — calibration range is zero",
                s.wet
            ));
        }

        let w = &self.water_level_bounds;
        for (name, v) in [("min", w.min), ("max", w.max)] {
            if !(0..=ADC_MAX).contains(&v) {
                errors.push(format!(
                    "water_level_bounds: {name} {v} out of ADC range [0, {ADC_MAX}]"
                ));
            }
        }
        if w.min >= w.max {
            errors.push(format!(
                "water_level_bounds: min ({}) must be less than max ({})",
                w.min, w.max
            ));
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let g = &self.gpio;
        let pins = [
            ("relay_pin", g.relay_pin),
            ("button_pin", g.button_pin),
            ("led_red_pin", g.led_red_pin),
            ("led_green_pin", g.led_green_pin),
            ("led_blue_pin", g.led_blue_pin),
        ];

        let mut seen: HashSet<u8> = HashSet::new();
        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "gpio: {name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("gpio: {name} {pin} is already in use"));
            }
        }

        if g.button_debounce_ms < MIN_DEBOUNCE_MS {
            errors.push(format!(
                "gpio: button_debounce_ms {} is below the {MIN_DEBOUNCE_MS} ms minimum",
                g.button_debounce_ms
            ));
        }
        if g.led_pwm_hz.is_nan() || g.led_pwm_hz <= 0.0 {
            errors.push(format!(
                "gpio: led_pwm_hz must be positive, got {}",
                g.led_pwm_hz
            ));
        }
    }

    fn validate_sink(&self, errors: &mut Vec<String>) {
        let s = &self.sink;
        if !s.url.is_empty() && !(s.url.starts_with("http://") || s.url.starts_with("https://")) {
            errors.push(format!("sink: url '{}' must start with http:// or https://", s.url));
        }
        if s.root.trim().is_empty() {
            errors.push("sink: root is empty".into());
        }
        if s.timeout_ms == 0 {
            errors.push("sink: timeout_ms must be positive".into());
        }
    }

    fn validate_camera(&self, errors: &mut Vec<String>) {
        let c = &self.camera;
        if c.enabled && c.command.trim().is_empty() {
            errors.push("camera: command is empty".into());
        }
        if c.width == 0 || c.height == 0 {
            errors.push(format!(
                "camera: resolution {}x{} must be non-zero",
                c.width, c.height
            ));
        }
        if c.queue_depth == 0 {
            errors.push("camera: queue_depth must be at least 1".into());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a file that does not exist yields the defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        load(path)
    } else {
        tracing::info!(path, "no config file — using built-in defaults");
        Ok(Config::default())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.topic, "esp32/sensor/#");
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.control.soil_on_threshold, 3500);
        assert_eq!(config.control.burst_duration_ms, 5000);
        assert_eq!(config.control.cooldown_interval_ms, 10_000);
        assert_eq!(config.soil_calibration.wet, 300);
        assert_eq!(config.soil_calibration.dry, 3500);
        assert_eq!(config.water_level_bounds.max, 4095);
        assert_eq!(config.gpio.relay_pin, 24);
        assert!(config.gpio.relay_active_low);
        assert!(config.sink.url.is_empty());
        assert!(config.camera.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_tables_keep_other_defaults() {
        let toml_str = r#"
[control]
burst_duration_ms = 8000

[soil_calibration]
wet = 1200

[sink]
url = "https://example-default-rtdb.firebasedatabase.app"
auth_token = "secret"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.control.burst_duration_ms, 8000);
        assert_eq!(config.control.cooldown_interval_ms, 10_000);
        assert_eq!(config.soil_calibration.wet, 1200);
        assert_eq!(config.soil_calibration.dry, 3500);
        assert_eq!(config.sink.root, "mqtt");
        assert_eq!(config.sink.auth_token.as_deref(), Some("secret"));
        config.validate().unwrap();
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../../../config.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.gpio.led_green_pin, 27);
    }

    #[test]
    fn durations_from_millis() {
        let c = ControlConfig::default();
        assert_eq!(c.burst_duration(), Duration::from_secs(5));
        assert_eq!(c.cooldown_interval(), Duration::from_secs(10));
    }

    // -- MQTT ---------------------------------------------------------------

    #[test]
    fn mqtt_empty_topic_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topic = " ".into();
        assert_validation_err(&cfg, "mqtt: topic is empty");
    }

    #[test]
    fn mqtt_qos_out_of_range() {
        let mut cfg = Config::default();
        cfg.mqtt.qos = 3;
        assert_validation_err(&cfg, "qos 3 out of range");
    }

    // -- Control ------------------------------------------------------------

    #[test]
    fn control_zero_burst_rejected() {
        let mut cfg = Config::default();
        cfg.control.burst_duration_ms = 0;
        assert_validation_err(&cfg, "burst_duration_ms must be positive");
    }

    #[test]
    fn control_zero_cooldown_rejected() {
        let mut cfg = Config::default();
        cfg.control.cooldown_interval_ms = 0;
        assert_validation_err(&cfg, "cooldown_interval_ms must be positive");
    }

    #[test]
    fn control_threshold_outside_adc_range() {
        let mut cfg = Config::default();
        cfg.control.soil_on_threshold = 5000;
        assert_validation_err(&cfg, "soil_on_threshold 5000 out of ADC range");
    }

    // -- Calibration --------------------------------------------------------

    #[test]
    fn calibration_zero_range_rejected() {
        let mut cfg = Config::default();
        cfg.soil_calibration.wet = 2000;
        cfg.soil_calibration.dry = 2000;
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn calibration_out_of_adc_range() {
        let mut cfg = Config::default();
        cfg.soil_calibration.dry = 4096;
        assert_validation_err(&cfg, "dry 4096 out of ADC range");
    }

    #[test]
    fn water_bounds_inverted_rejected() {
        let mut cfg = Config::default();
        cfg.water_level_bounds.min = 3000;
        cfg.water_level_bounds.max = 1000;
        assert_validation_err(&cfg, "min (3000) must be less than max (1000)");
    }

    #[test]
    fn water_bounds_negative_rejected() {
        let mut cfg = Config::default();
        cfg.water_level_bounds.min = -1;
        assert_validation_err(&cfg, "min -1 out of ADC range");
    }

    // -- GPIO ---------------------------------------------------------------

    #[test]
    fn gpio_pin_0_rejected() {
        let mut cfg = Config::default();
        cfg.gpio.relay_pin = 0;
        assert_validation_err(&cfg, "relay_pin 0 is not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_pin_28_rejected() {
        let mut cfg = Config::default();
        cfg.gpio.led_blue_pin = 28;
        assert_validation_err(&cfg, "led_blue_pin 28 is not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_duplicate_pin_rejected() {
        let mut cfg = Config::default();
        cfg.gpio.button_pin = cfg.gpio.relay_pin;
        assert_validation_err(&cfg, "button_pin 24 is already in use");
    }

    #[test]
    fn gpio_debounce_below_minimum() {
        let mut cfg = Config::default();
        cfg.gpio.button_debounce_ms = 10;
        assert_validation_err(&cfg, "below the 30 ms minimum");
    }

    #[test]
    fn gpio_pwm_frequency_must_be_positive() {
        let mut cfg = Config::default();
        cfg.gpio.led_pwm_hz = 0.0;
        assert_validation_err(&cfg, "led_pwm_hz must be positive");
    }

    #[test]
    fn gpio_pwm_frequency_nan_rejected() {
        let mut cfg = Config::default();
        cfg.gpio.led_pwm_hz = f64::NAN;
        assert_validation_err(&cfg, "led_pwm_hz must be positive");
        cfg.gpio.led_pwm_hz = -50.0;
        assert_validation_err(&cfg, "led_pwm_hz must be positive");
    }

    // -- Sink / camera ------------------------------------------------------

    #[test]
    fn sink_url_scheme_required() {
        let mut cfg = Config::default();
        cfg.sink.url = "example.firebaseio.com".into();
        assert_validation_err(&cfg, "must start with http:// or https://");
    }

    #[test]
    fn camera_zero_queue_rejected() {
        let mut cfg = Config::default();
        cfg.camera.queue_depth = 0;
        assert_validation_err(&cfg, "queue_depth must be at least 1");
    }

    #[test]
    fn camera_empty_command_only_matters_when_enabled() {
        let mut cfg = Config::default();
        cfg.camera.command = "".into();
        assert_validation_err(&cfg, "camera: command is empty");

        cfg.camera.enabled = false;
        cfg.validate().unwrap();
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.mqtt.qos = 7;
        cfg.control.burst_duration_ms = 0;
        cfg.gpio.relay_pin = 1;

        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("3 errors"), "wrong error count in: {msg}");
        assert!(msg.contains("qos 7"), "missing qos error in: {msg}");
        assert!(msg.contains("burst_duration_ms"), "missing burst error in: {msg}");
        assert!(
            msg.contains("not a valid BCM GPIO pin"),
            "missing gpio error in: {msg}"
        );
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_or_default_missing_file() {
        let cfg = load_or_default("/nonexistent/irrigation-controller.toml").unwrap();
        assert_eq!(cfg.mqtt.port, 1883);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!(
            "irrigation-controller-invalid-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[control]\nburst_duration_ms = 0\n").unwrap();
        let err = load(path.to_str().unwrap()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{err:#}").contains("invalid config"));
    }
}
