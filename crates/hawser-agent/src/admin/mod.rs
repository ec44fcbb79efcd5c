//! Local admin surface
//!
//! A small HTTP endpoint bound to loopback only, for operators and
//! local tooling: status, live metrics, connection state, recent log
//! lines, and a restart trigger. It is not reachable from the network
//! and carries no authentication of its own.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use hawser_core::config::AdminConfig;
use hawser_core::time::current_time_secs;
use hawser_core::traits::MetricsSampler;

use crate::dispatch::SubscriptionTable;
use crate::pty::TerminalManager;
use crate::transport::ConnectionStatus;
use crate::update::PlatformInstaller;

/// How many log lines `/logs/recent` returns at most
const RECENT_LOG_LINES: usize = 200;

/// Delay before a requested restart, so the HTTP response gets out
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Everything the admin handlers can see
#[derive(Clone)]
pub struct AdminState {
    pub version: String,
    pub hostname: String,
    pub started_at: u64,
    pub status_rx: watch::Receiver<ConnectionStatus>,
    pub terminals: Arc<TerminalManager>,
    pub subscriptions: Arc<SubscriptionTable>,
    pub sampler: Option<Arc<dyn MetricsSampler>>,
    pub log_file: Option<PathBuf>,
    pub installer: Arc<dyn PlatformInstaller>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/connection", get(get_connection))
        .route("/logs/recent", get(get_recent_logs))
        .route("/restart", post(post_restart))
        .with_state(state)
}

/// Serve the admin endpoint until `shutdown` fires.
pub async fn serve(
    state: AdminState,
    config: &AdminConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let address = config.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind admin endpoint on {address}"))?;
    tracing::info!(address = %address, "Admin endpoint listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("admin endpoint failed")
}

async fn get_status(State(state): State<AdminState>) -> Json<Value> {
    let connection = state.status_rx.borrow().clone();
    Json(json!({
        "version": state.version,
        "hostname": state.hostname,
        "uptime_secs": current_time_secs().saturating_sub(state.started_at),
        "connected": connection.connected,
        "server_address": connection.server_address,
        "sessions": state.terminals.sessions().await,
        "subscriptions": state.subscriptions.channel_names().await,
    }))
}

async fn get_metrics(State(state): State<AdminState>) -> Response {
    match &state.sampler {
        Some(sampler) => match sampler.sample().await {
            Ok(metrics) => Json(metrics).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("sample failed: {e}"),
            )
                .into_response(),
        },
        None => (StatusCode::NOT_FOUND, "no metrics sampler configured").into_response(),
    }
}

async fn get_connection(State(state): State<AdminState>) -> Json<ConnectionStatus> {
    Json(state.status_rx.borrow().clone())
}

async fn get_recent_logs(State(state): State<AdminState>) -> Response {
    let Some(path) = state.log_file.clone() else {
        return (StatusCode::NOT_FOUND, "file logging is not configured").into_response();
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => recent_lines(&contents, RECENT_LOG_LINES).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to read log file: {e}"),
        )
            .into_response(),
    }
}

async fn post_restart(State(state): State<AdminState>) -> Response {
    tracing::info!("Restart requested via admin endpoint");
    let installer = Arc::clone(&state.installer);
    tokio::spawn(async move {
        tokio::time::sleep(RESTART_DELAY).await;
        if let Err(e) = installer.restart() {
            tracing::error!(error = %e, "Restart failed");
        }
    });
    (StatusCode::ACCEPTED, "restarting\n").into_response()
}

/// Last `limit` lines, in original order
fn recent_lines(contents: &str, limit: usize) -> String {
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].join("\n")
}
