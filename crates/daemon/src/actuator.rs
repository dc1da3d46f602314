//! Lamp relay (optocoupler) output. The `gpio` feature gates the real rppal
//! driver; without it, a mock pin logs state changes.
//!
//! Nothing outside [`crate::controller`] touches this type: the controller
//! serialises every write and always trusts [`LightSwitch::read`] over what
//! it asked for.

use anyhow::Result;
use tracing::{debug, info};

use crate::control::LightState;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct LightSwitch {
    pin: OutputPin,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl LightSwitch {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(pin_num)?.into_output();
        // Leave the pin where it is; the controller reconciles it against the
        // persisted state right after boot.
        pin.set_reset_on_drop(false);
        info!(gpio = pin_num, active_low, "light switch initialised");
        Ok(Self { pin, active_low })
    }

    pub fn write(&mut self, state: LightState) {
        // active-low: LOW = ON, HIGH = OFF
        if state.is_on() != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        debug!(%state, "light pin written");
    }

    pub fn read(&self) -> LightState {
        LightState::from_bool(self.pin.is_set_high() != self.active_low)
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct LightSwitch {
    level: LightState,
    /// When set, writes are swallowed and reads return this value, like a
    /// relay that silently failed.
    pub stuck: Option<LightState>,
}

#[cfg(not(feature = "gpio"))]
impl LightSwitch {
    pub fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        info!(gpio = pin_num, "[mock-gpio] light switch initialised (not wired)");
        Ok(Self {
            level: LightState::Off,
            stuck: None,
        })
    }

    pub fn write(&mut self, state: LightState) {
        if self.stuck.is_none() {
            self.level = state;
        }
        debug!(%state, "[mock-gpio] light pin written");
    }

    pub fn read(&self) -> LightState {
        self.stuck.unwrap_or(self.level)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
