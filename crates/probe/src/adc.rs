//! PCF8591 8-bit A/D converter over I2C.
//!
//! The photoresistor divider reads higher as the room gets darker; the
//! thermistor divider reads higher as it gets colder.

use rppal::i2c::I2c;
use std::{thread, time::Duration};

use crate::convert::{control_byte, Thermistor};
use crate::Quantity;

/// Default bus address with A0..A2 tied low.
pub const DEFAULT_ADDR: u16 = 0x48;

/// Settle time after selecting a channel.
const SETTLE: Duration = Duration::from_millis(5);

pub struct Pcf8591 {
    i2c: I2c,
}

impl Pcf8591 {
    /// Open I2C bus 1 and address the converter at `addr`.
    pub fn open(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::debug!(addr = format_args!("0x{addr:02x}"), "pcf8591 opened");
        Ok(Self { i2c })
    }

    /// Raw 0-255 reading of `channel`.
    pub fn read_raw(&mut self, channel: u8) -> anyhow::Result<u8> {
        self.i2c.write(&[control_byte(channel)])?;
        thread::sleep(SETTLE);

        // The first byte after a channel switch is the previous conversion.
        let mut buf = [0u8; 2];
        self.i2c.read(&mut buf)?;
        Ok(buf[1])
    }

    pub fn measure(&mut self, quantity: Quantity, channel: u8) -> anyhow::Result<f64> {
        let raw = self.read_raw(channel)?;
        tracing::debug!(?quantity, channel, raw, "adc read");
        match quantity {
            Quantity::Light => Ok(f64::from(raw)),
            Quantity::Temperature => Thermistor::default().celsius(raw),
        }
    }
}
