mod actuator;
mod config;
mod control;
mod controller;
mod error;
mod events;
mod host;
mod mqtt;
mod scheduler;
mod sensors;
mod state;
mod store;
mod supervisor;
mod telemetry;
mod tunnel;
mod web;
mod window;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::LightSwitch;
use controller::Controller;
use events::EventBus;
use scheduler::{Orchestrator, COMMAND_QUEUE};
use state::{EventKind, SystemState};
use store::{MemoryStore, SettingsStore, SqliteStore};
use supervisor::{Supervisor, TunnelStatus};
use tunnel::LocalTunnel;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("porchlight=info")),
        )
        .init();

    // ── Config (the only fatal startup step) ─────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let offset = cfg.control.utc_offset()?;

    // ── Settings store ──────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:porchlight.db?mode=rwc".to_string());
    let store: Arc<dyn SettingsStore> = match SqliteStore::connect(&db_url) {
        Ok(s) => {
            if let Err(e) = s.migrate().await {
                error!(%db_url, "settings store not reachable yet, retrying on each write: {e}");
            } else {
                info!(%db_url, "settings store ready");
            }
            Arc::new(s)
        }
        Err(e) => {
            error!(%db_url, "invalid settings store url, settings will not survive a restart: {e}");
            Arc::new(MemoryStore::new())
        }
    };

    // ── Light pin + controller ──────────────────────────────────────
    let switch = LightSwitch::new(cfg.control.light_gpio_pin, cfg.control.relay_active_low)
        .context("failed to open light pin")?;
    let (controller, reconciled) =
        Controller::boot(switch, store, cfg.control.policy.clone()).await;
    let controller = Arc::new(controller);

    let shared = SystemState::shared();
    {
        let mut st = shared.write().await;
        st.record(
            EventKind::System,
            format!("porchlight started, light {}", reconciled.confirmed),
        );
        if let Some(e) = &reconciled.anomaly {
            st.record(EventKind::Error, e.to_string());
        }
    }

    let shutdown = CancellationToken::new();
    let bus = EventBus::new();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);

    // ── Tunnel supervisor ───────────────────────────────────────────
    let mut tasks = Vec::new();
    let tunnel_rx = if cfg.tunnel.enabled {
        let connector = LocalTunnel::new(
            &cfg.tunnel.server,
            cfg.web.port,
            Duration::from_secs(cfg.tunnel.request_timeout_secs),
        )
        .context("invalid tunnel settings")?;
        let (supervisor, rx) = Supervisor::new(connector, cfg.tunnel.clone());
        tasks.push(tokio::spawn(supervisor.run(shutdown.clone())));
        rx
    } else {
        info!("tunnel disabled");
        watch::channel(TunnelStatus::default()).1
    };

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        commands: cmd_tx.clone(),
    };
    let web_port = cfg.web.port;
    let web_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port, web_shutdown).await {
            error!("{e:#}");
        }
    }));

    // ── MQTT ────────────────────────────────────────────────────────
    tasks.push(tokio::spawn(mqtt::run(
        cfg.mqtt.clone(),
        cmd_tx,
        bus.subscribe(),
        Arc::clone(&shared),
        shutdown.clone(),
    )));

    // ── Orchestrator ────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        controller,
        cfg.control.clone(),
        cfg.sources.clone(),
        cfg.health.clone(),
        cfg.host.clone(),
        bus,
        Arc::clone(&shared),
        tunnel_rx,
        offset,
    ));
    tasks.push(tokio::spawn(orchestrator.run(cmd_rx, shutdown.clone())));

    wait_for_signal().await;
    info!("shutdown requested");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("task ended abnormally: {e}");
        }
    }
    info!("porchlight stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
