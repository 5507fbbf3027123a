//! Pump relay output: one polarity-aware GPIO pin on the `gpio` build, a
//! logging stand-in otherwise.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Write side of the actuator.  Writes are fire-and-forget at this layer.
pub trait RelayDriver: Send {
    fn set_energized(&mut self, on: bool);
}

// ---------------------------------------------------------------------------
// Real relay pin
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayPin {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayPin {
    pub(crate) fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(gpio_pin)?.into_output();

        // Fail-safe: ensure "OFF" at startup
        if active_low {
            pin.set_high(); // active-low relay OFF
        } else {
            pin.set_low(); // active-high relay OFF
        }

        tracing::info!(gpio = gpio_pin, active_low, "relay initialised");
        Ok(Self { pin, active_low })
    }
}

#[cfg(feature = "gpio")]
impl RelayDriver for RelayPin {
    fn set_energized(&mut self, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        tracing::debug!("relay set {}", if on { "ON" } else { "OFF" });
    }
}

// ---------------------------------------------------------------------------
// Mock relay
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayPin {
    pub(super) on: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayPin {
    pub(crate) fn new(gpio_pin: u8, _active_low: bool) -> Result<Self> {
        tracing::info!("[mock-gpio] relay registered (gpio {gpio_pin} — not wired)");
        Ok(Self { on: false })
    }
}

#[cfg(not(feature = "gpio"))]
impl RelayDriver for RelayPin {
    fn set_energized(&mut self, on: bool) {
        self.on = on;
        tracing::info!("[mock-gpio] relay set {}", if on { "ON" } else { "OFF" });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
