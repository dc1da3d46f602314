//! In-process fan-out of status broadcasts. Delivery is best-effort: a slow
//! subscriber lags and loses messages, the publisher never waits.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::trace;

use crate::control::{ControlSettings, LightLevel, LIGHT_LEVELS};
use crate::host::HostStats;
use crate::supervisor::TunnelStatus;
use crate::telemetry::TelemetrySnapshot;

const BUS_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    /// Absent for broadcasts triggered by a light change between polls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<TelemetrySnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_level: Option<LightLevel>,
    pub settings: ControlSettings,
    pub connectivity: TunnelStatus,
    pub host: HostStats,
    pub light_levels: &'static [(LightLevel, f64)],
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Broadcast {
    pub fn new(
        snapshot: Option<TelemetrySnapshot>,
        light_level: Option<LightLevel>,
        settings: ControlSettings,
        connectivity: TunnelStatus,
        host: HostStats,
    ) -> Self {
        Self {
            snapshot,
            light_level,
            settings,
            connectivity,
            host,
            light_levels: &LIGHT_LEVELS,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Broadcast>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers received it; zero is not an error.
    pub fn publish(&self, msg: Broadcast) -> usize {
        let n = self.tx.send(msg).unwrap_or(0);
        trace!(subscribers = n, "broadcast published");
        n
    }
}
