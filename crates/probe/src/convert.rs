//! Raw PCF8591 counts to physical values. Pure functions so they can be
//! tested without the I2C bus.

use anyhow::{ensure, Result};

/// Full scale of the 8-bit converter.
pub const FULL_SCALE: u8 = 255;

/// PCF8591 control byte: analog output enabled, single-ended input `channel`.
pub fn control_byte(channel: u8) -> u8 {
    0x40 | (channel & 0x03)
}

/// Validate a channel index from the environment (0-3).
pub fn parse_channel(name: &str, raw: Option<&str>, default: u8) -> Result<u8> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(default);
    };
    let ch: u8 = raw
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid channel in {name}: {raw:?}"))?;
    ensure!(ch <= 3, "channel {ch} in {name} exceeds maximum (3)");
    Ok(ch)
}

/// NTC thermistor in a divider with a fixed resistor of the same nominal
/// value, read against the converter's reference.
#[derive(Debug, Clone, Copy)]
pub struct Thermistor {
    /// Resistance at `nominal_celsius`.
    pub nominal_ohms: f64,
    pub nominal_celsius: f64,
    pub beta: f64,
    pub series_ohms: f64,
}

impl Default for Thermistor {
    fn default() -> Self {
        Self {
            nominal_ohms: 10_000.0,
            nominal_celsius: 25.0,
            beta: 3950.0,
            series_ohms: 10_000.0,
        }
    }
}

impl Thermistor {
    /// Beta-equation temperature for an 8-bit reading. The rails mean an open
    /// or shorted sensor and are rejected.
    pub fn celsius(&self, raw: u8) -> Result<f64> {
        ensure!(
            raw > 0 && raw < FULL_SCALE,
            "thermistor reading {raw} at the rail (open or shorted sensor)"
        );
        let ratio = f64::from(raw) / f64::from(FULL_SCALE);
        let ohms = self.series_ohms * ratio / (1.0 - ratio);
        let nominal_kelvin = self.nominal_celsius + 273.15;
        let kelvin = 1.0 / ((ohms / self.nominal_ohms).ln() / self.beta + 1.0 / nominal_kelvin);
        Ok(kelvin - 273.15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_byte_selects_channel() {
        assert_eq!(control_byte(0), 0x40);
        assert_eq!(control_byte(3), 0x43);
        assert_eq!(control_byte(7), 0x43);
    }

    #[test]
    fn parse_channel_default_and_explicit() {
        assert_eq!(parse_channel("X", None, 1).unwrap(), 1);
        assert_eq!(parse_channel("X", Some(" "), 1).unwrap(), 1);
        assert_eq!(parse_channel("X", Some(" 2 "), 0).unwrap(), 2);
    }

    #[test]
    fn parse_channel_rejects_bad_values() {
        assert!(parse_channel("X", Some("4"), 0).is_err());
        assert!(parse_channel("X", Some("-1"), 0).is_err());
        assert!(parse_channel("X", Some("a0"), 0).is_err());
    }

    #[test]
    fn thermistor_midscale_is_nominal() {
        // 127.5 would be exact; 127 and 128 straddle 25 °C.
        let t = Thermistor::default();
        let warmer = t.celsius(127).unwrap();
        let cooler = t.celsius(128).unwrap();
        assert!(cooler < 25.0 && 25.0 < warmer, "127 -> {warmer}, 128 -> {cooler}");
    }

    #[test]
    fn thermistor_cools_as_reading_rises() {
        // NTC on the low side of the divider: more counts, more ohms, colder.
        let t = Thermistor::default();
        let a = t.celsius(60).unwrap();
        let b = t.celsius(120).unwrap();
        let c = t.celsius(200).unwrap();
        assert!(a > b && b > c, "{a} {b} {c}");
    }

    #[test]
    fn thermistor_rails_are_errors() {
        let t = Thermistor::default();
        assert!(t.celsius(0).is_err());
        assert!(t.celsius(255).is_err());
    }
}
