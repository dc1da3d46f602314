//! One-shot sensor probe. Prints a single numeric line on stdout and exits;
//! diagnostics go to stderr.
//!
//! ```text
//! porchlight-probe light         # 0-255, higher is darker
//! porchlight-probe temperature   # degrees Celsius
//! ```

#[cfg(feature = "adc")]
mod adc;
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
mod convert;
#[cfg(feature = "sim")]
mod sim;

use anyhow::{Context, Result};
use std::{env, fmt, str::FromStr};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Light,
    Temperature,
}

impl FromStr for Quantity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" | "photoresistor" => Ok(Self::Light),
            "temperature" | "temp" | "thermistor" => Ok(Self::Temperature),
            other => anyhow::bail!("unknown quantity '{other}' (use light or temperature)"),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Light => write!(f, "light"),
            Self::Temperature => write!(f, "temperature"),
        }
    }
}

/// Light is an integer count, temperature has one decimal.
fn format_value(quantity: Quantity, value: f64) -> String {
    match quantity {
        Quantity::Light => format!("{value:.0}"),
        Quantity::Temperature => format!("{value:.1}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let quantity: Quantity = env::args()
        .nth(1)
        .context("usage: porchlight-probe <light|temperature>")?
        .parse()?;

    let value = measure(quantity).with_context(|| format!("{quantity} probe failed"))?;
    println!("{}", format_value(quantity, value));
    Ok(())
}

#[cfg(feature = "adc")]
fn measure(quantity: Quantity) -> Result<f64> {
    let (name, default) = match quantity {
        Quantity::Light => ("PROBE_LIGHT_CHANNEL", 0),
        Quantity::Temperature => ("PROBE_TEMP_CHANNEL", 1),
    };
    let channel = convert::parse_channel(name, env::var(name).ok().as_deref(), default)?;
    adc::Pcf8591::open(adc::DEFAULT_ADDR)?.measure(quantity, channel)
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
fn measure(quantity: Quantity) -> Result<f64> {
    use time::OffsetDateTime;

    let offset = parse_offset(env::var("PROBE_UTC_OFFSET_MINUTES").ok().as_deref());
    let now = OffsetDateTime::now_utc().to_offset(offset);
    let minute = u16::from(now.hour()) * 60 + u16::from(now.minute());

    tracing::debug!(%quantity, minute, "simulated read");
    Ok(sim::Sim::default().sample(quantity, minute))
}

/// Fixed UTC offset in minutes; no daylight saving. Unparseable or out of
/// range values fall back to UTC.
#[cfg(all(feature = "sim", not(feature = "adc")))]
fn parse_offset(raw: Option<&str>) -> time::UtcOffset {
    raw.and_then(|s| s.trim().parse::<i32>().ok())
        .and_then(|min| min.checked_mul(60))
        .and_then(|secs| time::UtcOffset::from_whole_seconds(secs).ok())
        .unwrap_or(time::UtcOffset::UTC)
}

#[cfg(not(any(feature = "sim", feature = "adc")))]
fn measure(_quantity: Quantity) -> Result<f64> {
    anyhow::bail!("built without a measurement backend (enable `sim` or `adc`)")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_parses_aliases() {
        assert_eq!("light".parse::<Quantity>().unwrap(), Quantity::Light);
        assert_eq!(" Photoresistor ".parse::<Quantity>().unwrap(), Quantity::Light);
        assert_eq!("TEMP".parse::<Quantity>().unwrap(), Quantity::Temperature);
        assert!("humidity".parse::<Quantity>().is_err());
    }

    #[test]
    fn output_is_one_parseable_number() {
        let light = format_value(Quantity::Light, 219.6);
        assert_eq!(light, "220");
        let temp = format_value(Quantity::Temperature, 21.449);
        assert_eq!(temp, "21.4");
        assert!(temp.parse::<f64>().is_ok());
        assert!(!temp.contains('\n'));
    }

    #[cfg(all(feature = "sim", not(feature = "adc")))]
    #[test]
    fn offset_env_is_bounded() {
        assert_eq!(parse_offset(Some("120")).whole_minutes(), 120);
        assert_eq!(parse_offset(Some(" -60 ")).whole_minutes(), -60);
        assert_eq!(parse_offset(Some("2147483647")), time::UtcOffset::UTC);
        assert_eq!(parse_offset(Some("noon")), time::UtcOffset::UTC);
        assert_eq!(parse_offset(None), time::UtcOffset::UTC);
    }

    #[cfg(all(feature = "sim", not(feature = "adc")))]
    #[test]
    fn simulated_measure_succeeds() {
        let v = measure(Quantity::Light).unwrap();
        assert!((0.0..=255.0).contains(&v));
    }
}
