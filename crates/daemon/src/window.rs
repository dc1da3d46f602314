//! Range helpers with explicit bounds: inclusive numeric ranges and
//! minute-of-day windows that may wrap past midnight.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::Time;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// `lo <= value <= hi`.
pub fn within<T: PartialOrd>(value: T, lo: T, hi: T) -> bool {
    value >= lo && value <= hi
}

pub fn minute_of_day(t: Time) -> u16 {
    u16::from(t.hour()) * 60 + u16::from(t.minute())
}

/// Half-open `[start, end)` window over the minutes of a day. When
/// `start > end` the window wraps midnight (e.g. 23:00–06:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeWindow {
    start: u16,
    end: u16,
}

impl TimeWindow {
    pub fn new(start: u16, end: u16) -> Result<Self, String> {
        if start >= MINUTES_PER_DAY || end >= MINUTES_PER_DAY {
            return Err(format!(
                "window bounds {start}..{end} outside 0..{MINUTES_PER_DAY}"
            ));
        }
        if start == end {
            return Err(format!("window {} is empty", fmt_minute(start)));
        }
        Ok(Self { start, end })
    }

    /// Whole-hour window for literals. Bounds are not checked: `start` and
    /// `end` must be distinct hours below 24.
    pub const fn hours(start: u8, end: u8) -> Self {
        Self {
            start: start as u16 * 60,
            end: end as u16 * 60,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains_minute(&self, minute: u16) -> bool {
        if self.start < self.end {
            self.start <= minute && minute < self.end
        } else {
            minute >= self.start || minute < self.end
        }
    }

    pub fn contains(&self, t: Time) -> bool {
        self.contains_minute(minute_of_day(t))
    }
}

fn fmt_minute(m: u16) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

fn parse_minute(s: &str) -> Result<u16, String> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
    let h: u16 = h.parse().map_err(|_| format!("bad hour in {s:?}"))?;
    let m: u16 = m.parse().map_err(|_| format!("bad minute in {s:?}"))?;
    if h > 23 || m > 59 {
        return Err(format!("time {s:?} out of range"));
    }
    Ok(h * 60 + m)
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", fmt_minute(self.start), fmt_minute(self.end))
    }
}

impl TryFrom<String> for TimeWindow {
    type Error = String;

    /// Parses `"18:00-23:00"`.
    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| format!("expected HH:MM-HH:MM, got {s:?}"))?;
        Self::new(parse_minute(a)?, parse_minute(b)?)
    }
}

impl From<TimeWindow> for String {
    fn from(w: TimeWindow) -> Self {
        w.to_string()
    }
}
