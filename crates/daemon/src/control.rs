//! Light decision policy: a pure function of
//! `(reading, mode, previous state, time of day)`.
//!
//! ## Sensor mode
//!
//! ```text
//!            ┌──[in evening window] or [dark and not deep-night]──┐
//!            │                                                    ▼
//!           Off                                                   On
//!            ▲                                                    │
//!            └──[in deep-night window] or [bright and not evening]┘
//! ```
//!
//! Anything else leaves the state untouched, so a lit room at dusk (the
//! lamp itself raising the reading) does not flip the lamp back off.
//!
//! ## Manual mode
//!
//! Readings are ignored; only client commands and toggles change state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::Time;

use crate::window::{within, TimeWindow};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sensor,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightState {
    On,
    Off,
}

impl LightState {
    pub fn from_bool(on: bool) -> Self {
        if on {
            LightState::On
        } else {
            LightState::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == LightState::On
    }

    pub fn flipped(self) -> Self {
        Self::from_bool(!self.is_on())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LightState::On => "on",
            LightState::Off => "off",
        }
    }
}

impl fmt::Display for LightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_on() { "ON" } else { "OFF" })
    }
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Sensor => "sensor",
            Mode::Manual => "manual",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sensor" | "auto" => Ok(Mode::Sensor),
            "manual" => Ok(Mode::Manual),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

impl FromStr for LightState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" => Ok(LightState::On),
            "OFF" | "0" => Ok(LightState::Off),
            other => Err(format!("unknown light state '{other}'")),
        }
    }
}

/// The persisted control record. One per installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSettings {
    pub mode: Mode,
    pub light_state: LightState,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Sensor,
            light_state: LightState::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Sensor,
    Client,
    Toggle,
}

/// Ephemeral input to the apply step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorCommand {
    pub requested: LightState,
    pub origin: Origin,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightPolicy {
    /// Readings at or above this are "dark" (higher = darker on the
    /// photoresistor divider).
    pub dark_threshold: f64,
    /// Below this the room is lit enough to poll slowly during sleep hours.
    pub sleep_threshold: f64,
    /// Lamp is forced on.
    pub evening: TimeWindow,
    /// Lamp is forced off.
    pub deep_night: TimeWindow,
    /// Hours where a lit room triggers the short evaluation interval.
    pub sleep_window: TimeWindow,
}

impl Default for LightPolicy {
    fn default() -> Self {
        Self {
            dark_threshold: 210.0,
            sleep_threshold: 216.0,
            evening: TimeWindow::hours(18, 23),
            deep_night: TimeWindow::hours(23, 6),
            sleep_window: TimeWindow::hours(23, 2),
        }
    }
}

/// Next automatic state. `reading` is `None` when the light source failed;
/// the time windows still apply but the threshold terms cannot fire.
pub fn decide(
    policy: &LightPolicy,
    reading: Option<f64>,
    mode: Mode,
    prev: LightState,
    now: Time,
) -> LightState {
    if mode == Mode::Manual {
        return prev;
    }

    let evening = policy.evening.contains(now);
    let deep_night = policy.deep_night.contains(now);
    let dark = reading.map(|r| r >= policy.dark_threshold);

    match prev {
        LightState::Off if evening || (dark == Some(true) && !deep_night) => LightState::On,
        LightState::On if deep_night || (dark == Some(false) && !evening) => LightState::Off,
        unchanged => unchanged,
    }
}

/// State an external command asks for, or `None` if the command is not
/// honoured under `mode`. Client targets only apply in manual mode; toggles
/// and sensor decisions always pass through.
pub fn resolve_command(cmd: &ActuatorCommand, mode: Mode) -> Option<LightState> {
    match (cmd.origin, mode) {
        (Origin::Client, Mode::Sensor) => None,
        _ => Some(cmd.requested),
    }
}

/// Whether the next evaluation should use the short interval: a lit room
/// during the sleep window means someone is still up.
pub fn is_sleep_time(policy: &LightPolicy, reading: Option<f64>, now: Time) -> bool {
    matches!(reading, Some(r) if r < policy.sleep_threshold) && policy.sleep_window.contains(now)
}

// ---------------------------------------------------------------------------
// Light level bands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LightLevel {
    GoodLight,
    MediumLight,
    LightDark,
    Dark,
    VeryDark,
    Blackhole,
}

/// Upper bound (inclusive) of each band on the 8-bit A/D scale.
pub const LIGHT_LEVELS: [(LightLevel, f64); 6] = [
    (LightLevel::GoodLight, 180.0),
    (LightLevel::MediumLight, 195.0),
    (LightLevel::LightDark, 210.0),
    (LightLevel::Dark, 216.0),
    (LightLevel::VeryDark, 225.0),
    (LightLevel::Blackhole, 255.0),
];

pub fn classify(reading: f64) -> LightLevel {
    let mut lower = f64::NEG_INFINITY;
    for (level, upper) in LIGHT_LEVELS {
        if within(reading, lower, upper) {
            return level;
        }
        lower = upper;
    }
    LightLevel::Blackhole
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::time;

    fn policy() -> LightPolicy {
        LightPolicy::default()
    }

    // -- Sensor mode ---------------------------------------------------------

    #[test]
    fn dark_evening_turns_on() {
        let next = decide(&policy(), Some(220.0), Mode::Sensor, LightState::Off, time!(19:00));
        assert_eq!(next, LightState::On);
    }

    #[test]
    fn deep_night_forces_off_even_when_dark() {
        let next = decide(&policy(), Some(220.0), Mode::Sensor, LightState::On, time!(02:00));
        assert_eq!(next, LightState::Off);
    }

    #[test]
    fn evening_turns_on_even_when_bright() {
        let next = decide(&policy(), Some(150.0), Mode::Sensor, LightState::Off, time!(18:30));
        assert_eq!(next, LightState::On);
    }

    #[test]
    fn dark_afternoon_turns_on() {
        let next = decide(&policy(), Some(215.0), Mode::Sensor, LightState::Off, time!(15:00));
        assert_eq!(next, LightState::On);
    }

    #[test]
    fn dark_deep_night_stays_off() {
        let next = decide(&policy(), Some(240.0), Mode::Sensor, LightState::Off, time!(03:00));
        assert_eq!(next, LightState::Off);
    }

    #[test]
    fn bright_daytime_turns_off() {
        let next = decide(&policy(), Some(150.0), Mode::Sensor, LightState::On, time!(10:00));
        assert_eq!(next, LightState::Off);
    }

    #[test]
    fn evening_on_is_sticky_against_bright_reading() {
        let p = policy();
        let on = decide(&p, Some(220.0), Mode::Sensor, LightState::Off, time!(19:00));
        assert_eq!(on, LightState::On);
        // The lamp lights the room; the reading drops below threshold.
        let next = decide(&p, Some(170.0), Mode::Sensor, on, time!(19:05));
        assert_eq!(next, LightState::On);
    }

    #[test]
    fn threshold_is_inclusive() {
        let next = decide(&policy(), Some(210.0), Mode::Sensor, LightState::Off, time!(12:00));
        assert_eq!(next, LightState::On);
        let next = decide(&policy(), Some(209.9), Mode::Sensor, LightState::On, time!(12:00));
        assert_eq!(next, LightState::Off);
    }

    #[test]
    fn window_boundary_at_2300_belongs_to_deep_night() {
        let next = decide(&policy(), Some(220.0), Mode::Sensor, LightState::On, time!(23:00));
        assert_eq!(next, LightState::Off);
        let next = decide(&policy(), Some(220.0), Mode::Sensor, LightState::Off, time!(23:00));
        assert_eq!(next, LightState::Off);
    }

    #[test]
    fn failed_reading_keeps_state_outside_windows() {
        let p = policy();
        assert_eq!(decide(&p, None, Mode::Sensor, LightState::On, time!(12:00)), LightState::On);
        assert_eq!(decide(&p, None, Mode::Sensor, LightState::Off, time!(12:00)), LightState::Off);
    }

    #[test]
    fn failed_reading_still_honours_windows() {
        let p = policy();
        assert_eq!(decide(&p, None, Mode::Sensor, LightState::Off, time!(20:00)), LightState::On);
        assert_eq!(decide(&p, None, Mode::Sensor, LightState::On, time!(04:00)), LightState::Off);
    }

    #[test]
    fn decide_is_deterministic() {
        let p = policy();
        for minute in (0..24 * 60).step_by(7) {
            let t = Time::from_hms((minute / 60) as u8, (minute % 60) as u8, 0).unwrap();
            for reading in [None, Some(100.0), Some(210.0), Some(250.0)] {
                for prev in [LightState::On, LightState::Off] {
                    let a = decide(&p, reading, Mode::Sensor, prev, t);
                    let b = decide(&p, reading, Mode::Sensor, prev, t);
                    assert_eq!(a, b);
                }
            }
        }
    }

    // -- Manual mode ---------------------------------------------------------

    #[test]
    fn manual_mode_ignores_readings() {
        let p = policy();
        assert_eq!(decide(&p, Some(250.0), Mode::Manual, LightState::Off, time!(19:00)), LightState::Off);
        assert_eq!(decide(&p, Some(10.0), Mode::Manual, LightState::On, time!(02:00)), LightState::On);
    }

    #[test]
    fn manual_client_command_is_honoured() {
        let cmd = ActuatorCommand {
            requested: LightState::On,
            origin: Origin::Client,
        };
        assert_eq!(resolve_command(&cmd, Mode::Manual), Some(LightState::On));
    }

    #[test]
    fn client_command_ignored_in_sensor_mode() {
        let cmd = ActuatorCommand {
            requested: LightState::On,
            origin: Origin::Client,
        };
        assert_eq!(resolve_command(&cmd, Mode::Sensor), None);
    }

    #[test]
    fn toggle_passes_in_any_mode() {
        let cmd = ActuatorCommand {
            requested: LightState::Off,
            origin: Origin::Toggle,
        };
        assert_eq!(resolve_command(&cmd, Mode::Sensor), Some(LightState::Off));
        assert_eq!(resolve_command(&cmd, Mode::Manual), Some(LightState::Off));
    }

    // -- Sleep time ----------------------------------------------------------

    #[test]
    fn sleep_time_needs_lit_room_and_late_hour() {
        let p = policy();
        assert!(is_sleep_time(&p, Some(200.0), time!(23:30)));
        assert!(is_sleep_time(&p, Some(200.0), time!(01:59)));
        assert!(!is_sleep_time(&p, Some(200.0), time!(02:00)));
        assert!(!is_sleep_time(&p, Some(230.0), time!(00:30)));
        assert!(!is_sleep_time(&p, None, time!(00:30)));
    }

    // -- Parsing & levels ----------------------------------------------------

    #[test]
    fn parse_mode_and_state() {
        assert_eq!("Manual".parse::<Mode>(), Ok(Mode::Manual));
        assert_eq!(" sensor ".parse::<Mode>(), Ok(Mode::Sensor));
        assert!("both".parse::<Mode>().is_err());
        assert_eq!("on".parse::<LightState>(), Ok(LightState::On));
        assert_eq!("OFF\n".parse::<LightState>(), Ok(LightState::Off));
        assert!("dim".parse::<LightState>().is_err());
    }

    #[test]
    fn classify_bands() {
        assert_eq!(classify(100.0), LightLevel::GoodLight);
        assert_eq!(classify(180.0), LightLevel::GoodLight);
        assert_eq!(classify(190.0), LightLevel::MediumLight);
        assert_eq!(classify(210.0), LightLevel::LightDark);
        assert_eq!(classify(215.0), LightLevel::Dark);
        assert_eq!(classify(220.0), LightLevel::VeryDark);
        assert_eq!(classify(255.0), LightLevel::Blackhole);
        assert_eq!(classify(300.0), LightLevel::Blackhole);
    }

    #[test]
    fn default_settings_are_sensor_off() {
        let s = ControlSettings::default();
        assert_eq!(s.mode, Mode::Sensor);
        assert_eq!(s.light_state, LightState::Off);
    }
}
