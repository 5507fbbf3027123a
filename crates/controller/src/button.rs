//! Manual-burst push button.
//!
//! The `gpio` build registers a falling-edge interrupt on a pull-up input and
//! forwards debounced presses into the main loop through a bounded channel.
//! The mock build has no interrupt source; the channel simply never fires.

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, Level, Trigger};

/// A debounced press of the manual button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualPress;

/// Rejects edges that arrive within `window` of the last accepted one.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn accept(&mut self, now: Instant) -> bool {
        match self.last {
            Some(prev) if now.saturating_duration_since(prev) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Turns raw edges into debounced presses on the main-loop channel.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub(crate) struct PressForwarder {
    debouncer: Debouncer,
    tx: mpsc::Sender<ManualPress>,
}

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
impl PressForwarder {
    pub(crate) fn new(debounce: Duration, tx: mpsc::Sender<ManualPress>) -> Self {
        Self {
            debouncer: Debouncer::new(debounce),
            tx,
        }
    }

    /// Returns `true` if a press reached the channel.
    pub(crate) fn on_edge(&mut self, now: Instant) -> bool {
        if !self.debouncer.accept(now) {
            return false;
        }
        if self.tx.try_send(ManualPress).is_err() {
            tracing::warn!("manual press dropped, main loop busy");
            return false;
        }
        true
    }
}

/// rppal 0.17 hands the interrupt callback the pin level; it is ignored
/// (only falling edges are armed).
#[cfg(feature = "gpio")]
fn interrupt_callback(mut forwarder: PressForwarder) -> impl FnMut(Level) + Send + 'static {
    move |_level: Level| {
        forwarder.on_edge(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Real button (interrupt-driven)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct ManualButton {
    // Interrupt is cleared when the pin is dropped.
    _pin: InputPin,
}

#[cfg(feature = "gpio")]
impl ManualButton {
    pub(crate) fn new(gpio_pin: u8, debounce: Duration, tx: mpsc::Sender<ManualPress>) -> Result<Self> {
        let mut pin = Gpio::new()?.get(gpio_pin)?.into_input_pullup();
        let forwarder = PressForwarder::new(debounce, tx);
        pin.set_async_interrupt(Trigger::FallingEdge, interrupt_callback(forwarder))?;

        tracing::info!(gpio = gpio_pin, debounce_ms = debounce.as_millis() as u64, "button armed");
        Ok(Self { _pin: pin })
    }
}

// ---------------------------------------------------------------------------
// Mock button
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct ManualButton {
    _forwarder: PressForwarder,
}

#[cfg(not(feature = "gpio"))]
impl ManualButton {
    pub(crate) fn new(gpio_pin: u8, debounce: Duration, tx: mpsc::Sender<ManualPress>) -> Result<Self> {
        tracing::info!("[mock-gpio] button registered (gpio {gpio_pin}, not wired)");
        Ok(Self {
            _forwarder: PressForwarder::new(debounce, tx),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
