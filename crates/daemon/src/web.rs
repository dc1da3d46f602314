use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::scheduler::Command;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub commands: mpsc::Sender<Command>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/command", post(api_command))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_command(
    State(state): State<AppState>,
    Json(cmd): Json<Command>,
) -> impl IntoResponse {
    match state.commands.send(cmd).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": cmd_name(cmd) }))),
        Err(_) => {
            warn!(?cmd, "command queue closed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "daemon is shutting down" })),
            )
        }
    }
}

fn cmd_name(cmd: Command) -> &'static str {
    match cmd {
        Command::SetMode(_) => "set_mode",
        Command::SetLight(_) => "set_light",
        Command::Toggle => "toggle",
        Command::RequestTelemetry => "request_telemetry",
        Command::Reboot => "reboot",
        Command::Poweroff => "poweroff",
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
