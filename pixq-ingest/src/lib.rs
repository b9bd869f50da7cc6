//! PixQ ingest service library
//!
//! Exposes the component modules and the HTTP assembly for integration
//! testing.

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use pixq_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::services::orchestrator::Orchestrator;
use crate::services::progress::ProgressTracker;
use crate::services::upload_intake::UploadIntake;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub orchestrator: Arc<Orchestrator>,
    pub intake: Arc<UploadIntake>,
    pub progress: Arc<ProgressTracker>,
    /// Bearer token required on mutating endpoints when set
    pub api_token: Option<String>,
    /// Service startup timestamp for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        orchestrator: Arc<Orchestrator>,
        intake: Arc<UploadIntake>,
        progress: Arc<ProgressTracker>,
        api_token: Option<String>,
    ) -> Self {
        Self {
            db,
            event_bus,
            orchestrator,
            intake,
            progress,
            api_token,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;
    use tower_http::cors::CorsLayer;

    let auth = api::auth::AuthLayer {
        token: state.api_token.clone(),
    };

    Router::new()
        .merge(api::upload_routes())
        .merge(api::batch_routes())
        .merge(api::status_routes())
        .route("/api/events", get(api::event_stream))
        .layer(auth)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
