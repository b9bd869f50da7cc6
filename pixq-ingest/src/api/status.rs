//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    pub uptime_seconds: u64,
}

/// GET /api/status
pub async fn service_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);

    Json(StatusResponse {
        status: "ok".to_string(),
        module: "pixq-ingest".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
    })
}

/// Build status routes
pub fn status_routes() -> Router<AppState> {
    Router::new().route("/api/status", get(service_status))
}
