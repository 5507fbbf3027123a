//! Field-node sensor simulator for bench testing the controller.
//!
//! Produces the four channels the ESP32 board reports: air temperature and
//! humidity (physical units) plus soil moisture and water level as raw
//! 12-bit ADC counts.  Each channel is a random walk with mean reversion and
//! drift, with per-reading noise and occasional spikes on the ADC channels.
//! A capacitive soil probe reads *higher* as the soil dries.

use std::fmt;

/// Full scale of the board's 12-bit ADC.
pub const ADC_MAX: f64 = 4095.0;

/// Approximate N(0,1) (Irwin-Hall: sum of 12 uniforms minus 6).
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Soil dries steadily past the controller's trigger point.
    Drying,
    /// Everything hovers mid-range; the pump should never run.
    Stable,
    /// Heavy noise, frequent spikes, and dropped air-sensor reads.
    Flaky,
    /// Freshly watered bed, drying very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drying => "drying",
            Self::Stable => "stable",
            Self::Flaky => "flaky",
            Self::Wet => "wet",
        })
    }
}

// ---------------------------------------------------------------------------
// One channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Walk {
    value: f64,
    center: f64,
    drift: f64,
    sigma: f64,
    reversion: f64,
    lo: f64,
    hi: f64,
}

impl Walk {
    fn step(&mut self) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        self.value = (self.value + self.drift + pull + gaussian(0.0, self.sigma)).clamp(self.lo, self.hi);
        self.value
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// One tick of readings.  Air readings are `NaN` when the simulated sensor
/// read failed.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: i64,
    pub water_level: i64,
}

pub struct FieldSim {
    temperature: Walk,
    humidity: Walk,
    soil: Walk,
    water: Walk,
    adc_noise: f64,
    spike_prob: f64,
    spike_sigma: f64,
    dropout_prob: f64,
}

impl FieldSim {
    pub fn new(scenario: Scenario) -> Self {
        // (soil start, soil center, soil drift, adc noise, spike prob, spike sigma, dropout prob)
        let (start, center, drift, adc_noise, spike_prob, spike_sigma, dropout_prob) = match scenario {
            Scenario::Drying => (2600.0, 3700.0, 12.0, 25.0, 0.03, 400.0, 0.0),
            Scenario::Stable => (1900.0, 1900.0, 0.0, 10.0, 0.005, 200.0, 0.0),
            Scenario::Flaky => (2200.0, 2400.0, 5.0, 120.0, 0.10, 800.0, 0.05),
            Scenario::Wet => (700.0, 900.0, 2.0, 15.0, 0.01, 250.0, 0.0),
        };

        Self {
            temperature: Walk {
                value: gaussian(24.0, 1.0),
                center: 24.0,
                drift: 0.0,
                sigma: 0.15,
                reversion: 0.05,
                lo: -10.0,
                hi: 50.0,
            },
            humidity: Walk {
                value: gaussian(60.0, 3.0),
                center: 60.0,
                drift: 0.0,
                sigma: 0.5,
                reversion: 0.05,
                lo: 0.0,
                hi: 100.0,
            },
            soil: Walk {
                value: start + gaussian(0.0, 50.0),
                center,
                drift,
                sigma: 30.0,
                reversion: 0.01,
                lo: 0.0,
                hi: ADC_MAX,
            },
            // Reservoir slowly draining.
            water: Walk {
                value: gaussian(3000.0, 100.0),
                center: 2500.0,
                drift: -1.0,
                sigma: 8.0,
                reversion: 0.005,
                lo: 0.0,
                hi: ADC_MAX,
            },
            adc_noise,
            spike_prob,
            spike_sigma,
            dropout_prob,
        }
    }

    fn adc_reading(&self, base: f64) -> i64 {
        let spike = if fastrand::f64() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };
        (base + gaussian(0.0, self.adc_noise) + spike)
            .round()
            .clamp(0.0, ADC_MAX) as i64
    }

    fn air_reading(&self, value: f64) -> f64 {
        if fastrand::f64() < self.dropout_prob {
            f64::NAN
        } else {
            (value * 10.0).round() / 10.0
        }
    }

    /// Advance every channel one tick.
    pub fn sample(&mut self) -> Sample {
        let temperature = self.temperature.step();
        let humidity = self.humidity.step();
        let soil = self.soil.step();
        let water = self.water.step();

        Sample {
            temperature: self.air_reading(temperature),
            humidity: self.air_reading(humidity),
            soil_moisture: self.adc_reading(soil),
            water_level: self.adc_reading(water),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
