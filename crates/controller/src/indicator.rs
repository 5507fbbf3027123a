//! RGB status LED: green while the pump runs, red while idle, dark after
//! shutdown.
//!
//! On the `gpio` build the three channels are software-PWM outputs; the mock
//! build just remembers the last colour.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

#[cfg(feature = "gpio")]
use crate::config::GpioConfig;

/// Colour with each channel in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const ACTIVE: Rgb = Rgb { r: 0.0, g: 1.0, b: 0.0 };
    pub const IDLE: Rgb = Rgb { r: 1.0, g: 0.0, b: 0.0 };
    pub const OFF: Rgb = Rgb { r: 0.0, g: 0.0, b: 0.0 };

    /// Per-channel PWM duty.  A common-anode LED lights when its cathode is
    /// pulled low, so the duty is inverted.
    #[cfg_attr(not(feature = "gpio"), allow(dead_code))]
    pub fn duty(self, common_anode: bool) -> [f64; 3] {
        [self.r, self.g, self.b].map(|c| {
            let c = c.clamp(0.0, 1.0);
            if common_anode {
                1.0 - c
            } else {
                c
            }
        })
    }
}

pub fn color_for(energized: bool) -> Rgb {
    if energized {
        Rgb::ACTIVE
    } else {
        Rgb::IDLE
    }
}

pub trait Indicator: Send {
    fn set_color(&mut self, color: Rgb);
}

// ---------------------------------------------------------------------------
// Real RGB LED (software PWM on three GPIO pins)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct StatusLed {
    pins: [OutputPin; 3],
    common_anode: bool,
    pwm_hz: f64,
}

#[cfg(feature = "gpio")]
impl StatusLed {
    pub(crate) fn new(cfg: &GpioConfig) -> Result<Self> {
        let gpio = Gpio::new()?;
        let pins = [
            gpio.get(cfg.led_red_pin)?.into_output(),
            gpio.get(cfg.led_green_pin)?.into_output(),
            gpio.get(cfg.led_blue_pin)?.into_output(),
        ];
        tracing::info!(
            r = cfg.led_red_pin,
            g = cfg.led_green_pin,
            b = cfg.led_blue_pin,
            common_anode = cfg.led_common_anode,
            "status led initialised"
        );
        Ok(Self {
            pins,
            common_anode: cfg.led_common_anode,
            pwm_hz: cfg.led_pwm_hz,
        })
    }
}

#[cfg(feature = "gpio")]
impl Indicator for StatusLed {
    fn set_color(&mut self, color: Rgb) {
        let duty = color.duty(self.common_anode);
        for (pin, d) in self.pins.iter_mut().zip(duty) {
            if let Err(e) = pin.set_pwm_frequency(self.pwm_hz, d) {
                tracing::warn!("status led pwm write failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock RGB LED
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct StatusLed {
    pub(super) current: Rgb,
}

#[cfg(not(feature = "gpio"))]
impl StatusLed {
    pub(crate) fn new(_cfg: &crate::config::GpioConfig) -> Result<Self> {
        tracing::info!("[mock-gpio] status led registered (not wired)");
        Ok(Self { current: Rgb::OFF })
    }
}

#[cfg(not(feature = "gpio"))]
impl Indicator for StatusLed {
    fn set_color(&mut self, color: Rgb) {
        self.current = color;
        tracing::debug!(r = color.r, g = color.g, b = color.b, "[mock-gpio] status led");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_follows_relay_state() {
        assert_eq!(color_for(true), Rgb::ACTIVE);
        assert_eq!(color_for(false), Rgb::IDLE);
    }

    #[test]
    fn duty_common_cathode_is_direct() {
        assert_eq!(Rgb::ACTIVE.duty(false), [0.0, 1.0, 0.0]);
    }

    #[test]
    fn duty_common_anode_is_inverted() {
        assert_eq!(Rgb::ACTIVE.duty(true), [1.0, 0.0, 1.0]);
        assert_eq!(Rgb::OFF.duty(true), [1.0, 1.0, 1.0]);
    }

    #[test]
    fn duty_clamps_channels() {
        let c = Rgb { r: 1.5, g: -0.2, b: 0.5 };
        assert_eq!(c.duty(false), [1.0, 0.0, 0.5]);
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn mock_led_remembers_colour() {
        let mut led = StatusLed::new(&crate::config::GpioConfig::default()).unwrap();
        assert_eq!(led.current, Rgb::OFF);
        led.set_color(Rgb::IDLE);
        assert_eq!(led.current, Rgb::IDLE);
    }
}
