//! Liveness and metrics endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connector::ConnectorHandle;
use crate::leader::Leadership;
use crate::metrics;

#[derive(Clone)]
pub struct ProbeState {
    pub agent_id: String,
    pub connector: ConnectorHandle,
    pub leadership: Leadership,
    pub active_sessions: Arc<AtomicU32>,
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: SocketAddr, state: ProbeState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind probe listener on {addr}"))?;
    info!(addr = %addr, "probe listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("probe server")?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<ProbeState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "agentId": state.agent_id,
        "connection": state.connector.state().as_str(),
        "leader": state.leadership.is_leader(),
        "leaderIdentity": state.leadership.leader_identity(),
        "activeSessions": state.active_sessions.load(Ordering::Relaxed),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
