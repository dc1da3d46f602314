//! Telemetry aggregation: poll every configured source plus the host-health
//! probe concurrently and settle all of them into one snapshot.
//!
//! There is no fail-fast path. Each source carries its own timeout, so a hung
//! probe turns into a failed reading while the others complete normally.

use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::debug;

use crate::sensors::{read_source, HealthProbe, SensorReading, SourceSpec};

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Exactly one entry per configured source.
    pub readings: BTreeMap<String, SensorReading>,
    #[serde(serialize_with = "serialize_health")]
    pub host_health: Result<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

impl TelemetrySnapshot {
    /// Value of a source, if it was polled and succeeded.
    pub fn value(&self, source_id: &str) -> Option<f64> {
        self.readings.get(source_id).and_then(SensorReading::value)
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &str> {
        self.readings
            .values()
            .filter(|r| !r.succeeded)
            .map(|r| r.source_id.as_str())
    }
}

fn serialize_health<S: serde::Serializer>(
    health: &Result<String, String>,
    s: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Health<'a> {
        succeeded: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        report: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a str>,
    }
    let h = match health {
        Ok(report) => Health {
            succeeded: true,
            report: Some(report),
            error: None,
        },
        Err(e) => Health {
            succeeded: false,
            report: None,
            error: Some(e),
        },
    };
    h.serialize(s)
}

/// Poll all `sources` and the health probe at once and wait for every one.
pub async fn collect(sources: &[SourceSpec], health: &HealthProbe) -> TelemetrySnapshot {
    let polls = futures_util::future::join_all(sources.iter().map(read_source));
    let (readings, host_health) = tokio::join!(polls, health.run());

    let readings: BTreeMap<String, SensorReading> = readings
        .into_iter()
        .map(|r| (r.source_id.clone(), r))
        .collect();

    let snapshot = TelemetrySnapshot {
        readings,
        host_health: host_health.map_err(|e| e.to_string()),
        captured_at: OffsetDateTime::now_utc(),
    };

    debug!(
        sources = snapshot.readings.len(),
        failed = snapshot.failed_sources().count(),
        health_ok = snapshot.host_health.is_ok(),
        "telemetry collected"
    );

    snapshot
}

// ===========================================================================
// Tests
// ===========================================================================
