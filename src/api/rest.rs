//! Local REST API — a read-mostly view over the persisted sync status,
//! plus endpoints to request an immediate push or a configuration refresh.
//! This is what the status popup UI talks to.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::collector::{self, DeviceAttributes, DeviceSnapshot};
use crate::status::{summarize_health, HealthSummary, StatusStore, SyncStatus};
use crate::telemetry::PipelineHandle;

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub status: Arc<StatusStore>,
    pub attributes: Arc<dyn DeviceAttributes>,
    pub pipeline: PipelineHandle,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(sync_status))
        .route("/api/v1/device", get(device))
        .route("/api/v1/sync", post(sync_now))
        .route("/api/v1/config/reload", post(reload_config))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub version: String,
    pub uptime_secs: u64,
    pub hostname: Option<String>,
}

/// Persisted status with its derived health classification.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub health: HealthSummary,
    pub status: SyncStatus,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub queued: bool,
}

async fn health(State(state): State<AppState>) -> Json<AgentHealth> {
    Json(AgentHealth {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok()),
    })
}

async fn sync_status(
    State(state): State<AppState>,
) -> Result<Json<StatusView>, (StatusCode, String)> {
    let status = state
        .status
        .load()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let health = summarize_health(&status, Utc::now());
    Ok(Json(StatusView { health, status }))
}

/// Collect a fresh snapshot on demand. Reads the last check-in from the
/// store but never transmits.
async fn device(State(state): State<AppState>) -> Json<DeviceSnapshot> {
    let last_checkin = state.status.load_or_default().await.last_checkin_time;
    Json(collector::collect(state.attributes.as_ref(), last_checkin).await)
}

async fn sync_now(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Accepted>), (StatusCode, String)> {
    state
        .pipeline
        .push_now()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { queued: true })))
}

async fn reload_config(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Accepted>), (StatusCode, String)> {
    state
        .pipeline
        .refresh_config()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { queued: true })))
}
