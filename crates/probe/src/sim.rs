//! Simulated readings for development away from the Pi.
//!
//! Every invocation is a fresh process, so nothing carries over between
//! samples: the value is a function of the time of day plus noise.
//! - Light follows a daylight arch between sunrise and sunset on the same
//!   darker-is-higher scale as the real divider.
//! - Temperature swings around a daily mean, warmest mid-afternoon.

use std::f64::consts::PI;

use crate::Quantity;

const MINUTES_PER_DAY: f64 = 1440.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Sim {
    /// Minute of day the sun comes up / goes down.
    pub sunrise: f64,
    pub sunset: f64,
    /// Light counts at night and at solar noon.
    pub night: f64,
    pub noon: f64,
    pub light_sigma: f64,
    pub temp_mean: f64,
    pub temp_swing: f64,
    pub temp_sigma: f64,
}

impl Default for Sim {
    fn default() -> Self {
        Self {
            sunrise: 6.0 * 60.0,
            sunset: 20.0 * 60.0,
            night: 232.0,
            noon: 150.0,
            light_sigma: 2.5,
            temp_mean: 19.0,
            temp_swing: 4.0,
            temp_sigma: 0.2,
        }
    }
}

impl Sim {
    /// 0 at night, 1 at solar noon.
    pub fn daylight(&self, minute: f64) -> f64 {
        if minute <= self.sunrise || minute >= self.sunset {
            return 0.0;
        }
        (PI * (minute - self.sunrise) / (self.sunset - self.sunrise)).sin()
    }

    pub fn sample(&self, quantity: Quantity, minute: u16) -> f64 {
        let minute = f64::from(minute) % MINUTES_PER_DAY;
        match quantity {
            Quantity::Light => {
                let clean = self.night - (self.night - self.noon) * self.daylight(minute);
                gaussian(clean, self.light_sigma).round().clamp(0.0, 255.0)
            }
            Quantity::Temperature => {
                // Warmest at 15:00.
                let phase = 2.0 * PI * (minute - 15.0 * 60.0) / MINUTES_PER_DAY;
                let t = self.temp_mean + self.temp_swing * phase.cos();
                (gaussian(t, self.temp_sigma) * 10.0).round() / 10.0
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mean(sim: &Sim, q: Quantity, minute: u16, n: usize) -> f64 {
        (0..n).map(|_| sim.sample(q, minute)).sum::<f64>() / n as f64
    }

    #[test]
    fn daylight_is_zero_at_night_and_peaks_midday() {
        let sim = Sim::default();
        assert_eq!(sim.daylight(0.0), 0.0);
        assert_eq!(sim.daylight(23.0 * 60.0), 0.0);
        assert!((sim.daylight(13.0 * 60.0) - 1.0).abs() < 1e-9);
        assert!(sim.daylight(8.0 * 60.0) < sim.daylight(11.0 * 60.0));
    }

    #[test]
    fn light_stays_on_the_adc_scale() {
        let sim = Sim {
            light_sigma: 50.0,
            ..Sim::default()
        };
        for minute in (0..1440).step_by(7) {
            let v = sim.sample(Quantity::Light, minute);
            assert!((0.0..=255.0).contains(&v), "out of range: {v}");
            assert_eq!(v, v.round());
        }
    }

    #[test]
    fn night_reads_darker_than_noon() {
        let sim = Sim::default();
        let night = mean(&sim, Quantity::Light, 2 * 60, 50);
        let noon = mean(&sim, Quantity::Light, 13 * 60, 50);
        assert!(night > 210.0, "night should cross the dark threshold: {night}");
        assert!(noon < 180.0, "noon should be good light: {noon}");
    }

    #[test]
    fn afternoon_is_warmer_than_dawn() {
        let sim = Sim::default();
        let dawn = mean(&sim, Quantity::Temperature, 3 * 60, 50);
        let afternoon = mean(&sim, Quantity::Temperature, 15 * 60, 50);
        assert!(afternoon > dawn + 4.0, "dawn={dawn} afternoon={afternoon}");
    }

    #[test]
    fn temperature_has_one_decimal() {
        let v = Sim::default().sample(Quantity::Temperature, 600);
        assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-9);
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        // Std error is 1/sqrt(5000) ≈ 0.014.
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
