//! Connectivity supervisor: keeps a named public URL pointed at the local
//! web port for the life of the process.
//!
//! ```text
//! Uninitialized ──▶ Connecting ──▶ Connected(url) ──[close]──▶ Closed
//!                     ▲   │                                       │
//!                     │   └──▶ Failed ──[next identifier]──┐      │
//!                     │                                    │      │
//!                     ├───────────[retry delay]────────────┘      │
//!                     ├──[long back-off, all identifiers failed]  │
//!                     └──────────────[cool-down]──────────────────┘
//! ```
//!
//! Each negotiation round tries the primary identifier, then `<id>-1`,
//! `<id>-2`, ... up to `max_attempts`. A denied name and a transport error
//! are treated alike. When the round is exhausted the supervisor sleeps for
//! the long back-off and starts over from the primary identifier.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;
use crate::tunnel::{grants_subdomain, TunnelConnector, TunnelHandle};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TunnelPhase {
    Uninitialized,
    Connecting,
    Connected { url: String },
    Closed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelStatus {
    #[serde(flatten)]
    pub phase: TunnelPhase,
    pub attempted_address: String,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        Self {
            phase: TunnelPhase::Uninitialized,
            attempted_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub server: String,
    pub subdomain: String,
    /// Identifiers tried per negotiation round, primary included.
    pub max_attempts: u32,
    /// Pause between identifiers inside a round.
    pub retry_secs: u64,
    /// Pause after a live tunnel closes.
    pub cooldown_secs: u64,
    /// Pause after a whole round failed.
    pub long_backoff_secs: u64,
    /// Upper bound on a single negotiation request.
    pub request_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "https://localtunnel.me".to_string(),
            subdomain: "porch-light".to_string(),
            max_attempts: 3,
            retry_secs: 5,
            cooldown_secs: 30,
            long_backoff_secs: 30 * 60,
            request_timeout_secs: 30,
        }
    }
}

/// Identifier for attempt `n` of a round.
pub fn candidate(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        base.to_string()
    } else {
        format!("{base}-{attempt}")
    }
}

pub struct Supervisor<C> {
    connector: C,
    config: TunnelConfig,
    status: watch::Sender<TunnelStatus>,
}

impl<C: TunnelConnector> Supervisor<C> {
    pub fn new(connector: C, config: TunnelConfig) -> (Self, watch::Receiver<TunnelStatus>) {
        let (status, rx) = watch::channel(TunnelStatus::default());
        (
            Self {
                connector,
                config,
                status,
            },
            rx,
        )
    }

    /// Run until `shutdown` fires. Closes the live tunnel on the way out.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            subdomain = %self.config.subdomain,
            max_attempts = self.config.max_attempts,
            "tunnel supervisor started"
        );

        loop {
            let Some(handle) = self.negotiate(&shutdown).await else {
                if shutdown.is_cancelled() {
                    return;
                }
                warn!(
                    attempts = self.config.max_attempts,
                    backoff_secs = self.config.long_backoff_secs,
                    "tunnel: every identifier failed, backing off"
                );
                if !self.pause(self.config.long_backoff_secs, &shutdown).await {
                    return;
                }
                continue;
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    handle.close();
                    self.set_phase(TunnelPhase::Closed);
                    info!("tunnel closed for shutdown");
                    return;
                }
                _ = handle.closed() => {}
            }

            self.set_phase(TunnelPhase::Closed);
            warn!(
                cooldown_secs = self.config.cooldown_secs,
                "tunnel closed, reconnecting after cool-down"
            );
            if !self.pause(self.config.cooldown_secs, &shutdown).await {
                return;
            }
        }
    }

    /// One round over the identifiers. `None` when all failed or shutdown.
    async fn negotiate(&self, shutdown: &CancellationToken) -> Option<TunnelHandle> {
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 && !self.pause(self.config.retry_secs, shutdown).await {
                return None;
            }

            let id = candidate(&self.config.subdomain, attempt);
            self.status.send_replace(TunnelStatus {
                phase: TunnelPhase::Connecting,
                attempted_address: id.clone(),
            });

            let result = tokio::select! {
                _ = shutdown.cancelled() => return None,
                r = self.request(&id) => r,
            };

            match result {
                Ok(handle) => {
                    info!(url = handle.url(), attempt, "tunnel connected");
                    self.set_phase(TunnelPhase::Connected {
                        url: handle.url().to_string(),
                    });
                    return Some(handle);
                }
                Err(e) => {
                    warn!(identifier = %id, attempt, kind = e.kind(), "tunnel attempt failed: {e}");
                    self.set_phase(TunnelPhase::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        None
    }

    async fn request(&self, id: &str) -> Result<TunnelHandle, Error> {
        let limit = Duration::from_secs(self.config.request_timeout_secs);
        let handle = tokio::time::timeout(limit, self.connector.open(id))
            .await
            .map_err(|_| Error::ConnectivityError(format!("no reply within {limit:?}")))??;

        if !grants_subdomain(handle.url(), id) {
            handle.close();
            return Err(Error::ConnectivityDenied {
                requested: id.to_string(),
                granted: handle.url().to_string(),
            });
        }
        Ok(handle)
    }

    /// Sleep unless shutdown fires first. Returns `false` on shutdown.
    async fn pause(&self, secs: u64, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
        }
    }

    fn set_phase(&self, phase: TunnelPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
