//! Orchestrator: two independent timers plus the command intake.
//!
//! - **Telemetry** every `telemetry_interval`: collect a full snapshot, feed
//!   its light reading into the controller, broadcast.
//! - **Evaluation** every `evaluation_interval` (shorter during sleep time):
//!   read the light source alone and run the sensor policy.
//! - **Commands** from MQTT / HTTP are applied out of band from both timers.
//!
//! A fourth loop turns tunnel status changes into events. The loops never
//! wait on each other; a slow telemetry collection does not delay an
//! evaluation. All of them stop when the shutdown token fires.

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use sysinfo::System;
use time::{OffsetDateTime, Time, UtcOffset};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ControlConfig;
use crate::control::{classify, is_sleep_time, LightLevel, LightState, Mode};
use crate::controller::{Applied, Controller, Outcome};
use crate::events::{Broadcast, EventBus};
use crate::host::{HostCommands, HostStats, Lifecycle};
use crate::sensors::{self, HealthProbe, SensorReading, SourceSpec};
use crate::state::{EventKind, SharedState};
use crate::supervisor::{TunnelPhase, TunnelStatus};
use crate::telemetry::{self, TelemetrySnapshot};

/// Depth of the command queue shared by MQTT and HTTP producers.
pub const COMMAND_QUEUE: usize = 32;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// An external request. JSON form: `{"command": "set_light", "value": "on"}`,
/// `{"command": "toggle"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", content = "value", rename_all = "snake_case")]
pub enum Command {
    SetMode(Mode),
    SetLight(LightState),
    Toggle,
    RequestTelemetry,
    Reboot,
    Poweroff,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    controller: Arc<Controller>,
    control: ControlConfig,
    sources: Vec<SourceSpec>,
    health: HealthProbe,
    host: HostCommands,
    bus: EventBus,
    shared: SharedState,
    tunnel: watch::Receiver<TunnelStatus>,
    offset: UtcOffset,
    sys: Mutex<System>,
    /// Cuts the evaluation sleep short.
    wake: Notify,
    clock: fn(UtcOffset) -> Time,
}

fn wall_clock(offset: UtcOffset) -> Time {
    OffsetDateTime::now_utc().to_offset(offset).time()
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller: Arc<Controller>,
        control: ControlConfig,
        sources: Vec<SourceSpec>,
        health: HealthProbe,
        host: HostCommands,
        bus: EventBus,
        shared: SharedState,
        tunnel: watch::Receiver<TunnelStatus>,
        offset: UtcOffset,
    ) -> Self {
        Self {
            controller,
            control,
            sources,
            health,
            host,
            bus,
            shared,
            tunnel,
            offset,
            sys: Mutex::new(System::new()),
            wake: Notify::new(),
            clock: wall_clock,
        }
    }

    /// Run every loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        info!(
            sources = self.sources.len(),
            light_source = %self.control.light_source,
            telemetry_secs = self.control.telemetry_interval_secs,
            evaluation_secs = self.control.evaluation_interval_secs,
            "orchestrator started"
        );
        self.shared
            .write()
            .await
            .record(EventKind::System, "orchestrator started");

        tokio::join!(
            Arc::clone(&self).telemetry_loop(shutdown.clone()),
            Arc::clone(&self).evaluation_loop(shutdown.clone()),
            Arc::clone(&self).command_loop(commands, shutdown.clone()),
            Arc::clone(&self).tunnel_loop(shutdown.clone()),
        );

        info!("orchestrator stopped");
    }

    fn now(&self) -> Time {
        (self.clock)(self.offset)
    }

    fn light_source(&self) -> Option<&SourceSpec> {
        self.sources
            .iter()
            .find(|s| s.id == self.control.light_source)
    }

    // -- Loops --------------------------------------------------------------

    async fn telemetry_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.control.telemetry_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.broadcast_telemetry() => {}
            }
        }
        debug!("telemetry loop stopped");
    }

    async fn evaluation_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let reading = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.evaluate_once() => r,
            };

            let sleep_time = is_sleep_time(self.controller.policy(), reading, self.now());
            let delay = self.control.evaluation_interval(sleep_time);
            debug!(sleep_time, delay_secs = delay.as_secs(), "next evaluation scheduled");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => debug!("evaluation woken early"),
            }
        }
        debug!("evaluation loop stopped");
    }

    async fn command_loop(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            let cmd = tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(c) => c,
                    None => break,
                },
            };
            Arc::clone(&self).handle(cmd, &shutdown).await;
        }
        debug!("command loop stopped");
    }

    async fn tunnel_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self.tunnel.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let status = rx.borrow_and_update().clone();
            let detail = match &status.phase {
                TunnelPhase::Uninitialized => continue,
                TunnelPhase::Connecting => format!("tunnel connecting as '{}'", status.attempted_address),
                TunnelPhase::Connected { url } => format!("tunnel connected at {url}"),
                TunnelPhase::Closed => "tunnel closed".to_string(),
                TunnelPhase::Failed { reason } => format!("tunnel failed: {reason}"),
            };
            self.shared.write().await.record(EventKind::Tunnel, detail);
        }
        debug!("tunnel loop stopped");
    }

    // -- Work ---------------------------------------------------------------

    /// Collect a snapshot, feed its light reading to the controller and
    /// broadcast it.
    pub async fn broadcast_telemetry(&self) {
        // Ticket first: a manual write during collection wins.
        let ticket = self.controller.begin_evaluation().await;
        let snapshot = telemetry::collect(&self.sources, &self.health).await;

        {
            let mut st = self.shared.write().await;
            for reading in snapshot.readings.values() {
                st.record(EventKind::Reading, describe(reading));
            }
            if let Err(e) = &snapshot.host_health {
                st.record(EventKind::Error, format!("host health probe failed: {e}"));
            }
        }

        let reading = snapshot.value(&self.control.light_source);
        if reading.is_some() {
            let outcome = self.controller.evaluate(ticket, reading, self.now()).await;
            self.report(outcome, false).await;
        }

        info!(
            sources = snapshot.readings.len(),
            failed = snapshot.failed_sources().count(),
            light = ?reading,
            "telemetry collected"
        );
        self.publish(Some(snapshot), reading.map(classify)).await;
    }

    /// One automatic evaluation. Returns the light reading it used.
    pub async fn evaluate_once(&self) -> Option<f64> {
        let ticket = self.controller.begin_evaluation().await;

        let reading = match self.light_source() {
            Some(spec) => {
                let r = sensors::read_source(spec).await;
                if !r.succeeded {
                    self.shared.write().await.record(EventKind::Error, describe(&r));
                }
                r.value()
            }
            None => None,
        };

        let outcome = self.controller.evaluate(ticket, reading, self.now()).await;
        self.report(outcome, true).await;
        reading
    }

    pub async fn handle(self: Arc<Self>, cmd: Command, shutdown: &CancellationToken) {
        info!(?cmd, "command received");
        match cmd {
            Command::SetMode(mode) => {
                let change = self.controller.set_mode(mode).await;
                {
                    let mut st = self.shared.write().await;
                    st.record(EventKind::Mode, format!("mode set to {mode}"));
                    if let Some(e) = change.store_error {
                        st.record(EventKind::Error, format!("persisting mode failed: {e}"));
                    }
                }
                if mode == Mode::Sensor {
                    self.wake.notify_one();
                }
                self.publish(None, None).await;
            }
            Command::SetLight(state) => {
                let outcome = self.controller.set_light(state).await;
                if let Outcome::Ignored { mode } = &outcome {
                    self.shared.write().await.record(
                        EventKind::Light,
                        format!("light {state} request ignored in {mode} mode"),
                    );
                }
                self.report(outcome, true).await;
            }
            Command::Toggle => {
                let applied = self.controller.toggle().await;
                self.report_applied(&applied, true).await;
            }
            Command::RequestTelemetry => {
                // Collection can take seconds; keep the command queue moving.
                let this = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => debug!("requested telemetry dropped on shutdown"),
                        _ = this.broadcast_telemetry() => {}
                    }
                });
            }
            Command::Reboot | Command::Poweroff => {
                let action = if cmd == Command::Reboot {
                    Lifecycle::Reboot
                } else {
                    Lifecycle::Poweroff
                };
                self.shared
                    .write()
                    .await
                    .record(EventKind::System, format!("{action:?} requested"));
                if let Err(e) = self.host.run(action).await {
                    self.shared.write().await.record(EventKind::Error, e);
                }
            }
        }
    }

    async fn report(&self, outcome: Outcome, publish: bool) {
        match outcome {
            Outcome::Applied(applied) => self.report_applied(&applied, publish).await,
            Outcome::Discarded => debug!("stale evaluation dropped"),
            Outcome::Ignored { .. } => {}
        }
    }

    /// Record what an apply did. A confirmed change is broadcast at once
    /// unless the caller is about to broadcast anyway.
    async fn report_applied(&self, applied: &Applied, publish: bool) {
        {
            let mut st = self.shared.write().await;
            if let Some(e) = &applied.anomaly {
                st.record(EventKind::Error, e.to_string());
            }
            if let Some(e) = &applied.store_error {
                st.record(EventKind::Error, format!("persisting light state failed: {e}"));
            }
            if applied.changed {
                st.record(
                    EventKind::Light,
                    format!(
                        "light {} ({:?})",
                        applied.confirmed, applied.command.origin
                    ),
                );
            }
        }
        if publish && (applied.changed || applied.anomaly.is_some()) {
            self.publish(None, None).await;
        }
    }

    /// Build a broadcast, cache it for HTTP clients and fan it out. A
    /// broadcast without a snapshot keeps the last snapshot in the cache.
    async fn publish(&self, snapshot: Option<TelemetrySnapshot>, level: Option<LightLevel>) {
        let host = {
            let mut sys = self.sys.lock().unwrap_or_else(|p| p.into_inner());
            HostStats::sample(&mut sys)
        };
        let connectivity = self.tunnel.borrow().clone();
        let settings = self.controller.settings().await;
        let msg = Broadcast::new(snapshot, level, settings, connectivity, host);

        {
            let mut st = self.shared.write().await;
            let mut cached = msg.clone();
            if cached.snapshot.is_none() {
                if let Some(prev) = st.last_broadcast.take() {
                    cached.snapshot = prev.snapshot;
                    cached.light_level = prev.light_level;
                }
            }
            st.last_broadcast = Some(cached);
        }

        let n = self.bus.publish(msg);
        if n == 0 {
            debug!("broadcast had no subscribers");
        }
    }
}

fn describe(r: &SensorReading) -> String {
    match r.value() {
        Some(v) => format!("{} = {v}", r.source_id),
        None => format!(
            "{} failed: {}",
            r.source_id,
            r.error_detail.as_deref().unwrap_or("unknown error")
        ),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
