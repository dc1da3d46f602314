//! Failure taxonomy for the control core.
//!
//! None of these abort the process. Sensor failures are folded into the
//! snapshot, store failures leave the in-memory settings authoritative,
//! actuator mismatches are reported and connectivity failures only feed the
//! tunnel supervisor's back-off.

use std::time::Duration;

use thiserror::Error;

use crate::control::LightState;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("source '{source_id}' unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("source '{source_id}' produced unparseable output {output:?}")]
    SourceMalformed { source_id: String, output: String },

    #[error("source '{source_id}' timed out after {after:?}")]
    SourceTimeout { source_id: String, after: Duration },

    #[error("settings store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("actuator read back {actual} after writing {requested}")]
    ActuatorMismatch {
        requested: LightState,
        actual: LightState,
    },

    #[error("tunnel identifier '{requested}' denied (granted {granted})")]
    ConnectivityDenied { requested: String, granted: String },

    #[error("tunnel transport failure: {0}")]
    ConnectivityError(String),
}

impl Error {
    /// Short machine-friendly tag, used in events and JSON payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceUnavailable { .. } => "source_unavailable",
            Error::SourceMalformed { .. } => "source_malformed",
            Error::SourceTimeout { .. } => "source_timeout",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::ActuatorMismatch { .. } => "actuator_mismatch",
            Error::ConnectivityDenied { .. } => "connectivity_denied",
            Error::ConnectivityError(_) => "connectivity_error",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::ConnectivityError(e.to_string())
    }
}
