//! Batch status and operator endpoints
//!
//! Status and counters stay queryable at all times, including while a
//! batch is failing; resume and force-retry let operators re-drive a
//! batch without re-submitting source files.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{batches, items};
use crate::error::{ApiError, ApiResult};
use crate::models::{Batch, Item, Job};
use crate::services::orchestrator::QueueStats;
use crate::AppState;
use pixq_common::status::ProcessingStatus;

/// GET /api/batches/:id
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<Batch>> {
    let batch = batches::get(&state.db, batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("batch {}", batch_id)))?;
    Ok(Json(batch))
}

#[derive(Debug, Deserialize)]
pub struct ItemListQuery {
    /// Filter by processing status, e.g. `failed` or `orphaned`
    pub status: Option<String>,
}

/// GET /api/batches/:id/items?status=
pub async fn list_batch_items(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<ItemListQuery>,
) -> ApiResult<Json<Vec<Item>>> {
    batches::get(&state.db, batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("batch {}", batch_id)))?;

    let items = match query.status {
        Some(raw) => {
            let status: ProcessingStatus = raw
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("unknown status: {}", raw)))?;
            items::list_for_batch_with_status(&state.db, batch_id, status).await?
        }
        None => items::list_for_batch(&state.db, batch_id).await?,
    };

    Ok(Json(items))
}

/// Response for resume and force-retry
#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub batch_id: Uuid,
    pub queue_position: usize,
    /// Failed items reset to pending (force-retry only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_items: Option<u64>,
}

/// POST /api/batches/:id/resume
///
/// Re-enqueues the batch; only pending/retry items are re-processed.
/// 409 when nothing is resumable or the batch is currently being worked.
pub async fn resume_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<RequeueResponse>> {
    let batch = batches::get(&state.db, batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("batch {}", batch_id)))?;

    if items::count_resumable(&state.db, batch_id).await? == 0 {
        return Err(ApiError::Conflict(
            "batch has no pending or retry items to resume".to_string(),
        ));
    }

    if !batches::mark_queued_for_resume(&state.db, batch_id).await? {
        return Err(ApiError::Conflict(format!(
            "batch cannot be resumed from status {}",
            batch.status
        )));
    }

    let queue_position = state
        .orchestrator
        .enqueue(Job::resume(batch_id, &batch.name))?;

    Ok(Json(RequeueResponse {
        batch_id,
        queue_position,
        reset_items: None,
    }))
}

/// POST /api/batches/:id/force-retry
///
/// Resets this batch's failed items to pending, rolls their earlier
/// failure outcomes out of the counters, and re-enqueues the batch.
pub async fn force_retry_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<RequeueResponse>> {
    let batch = batches::get(&state.db, batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("batch {}", batch_id)))?;

    if !batches::mark_queued_for_resume(&state.db, batch_id).await? {
        return Err(ApiError::Conflict(format!(
            "batch cannot be retried from status {}",
            batch.status
        )));
    }

    let reset = items::reset_failed_to_pending(&state.db, batch_id).await?;
    state
        .progress
        .rollback_for_retry(&state.db, batch_id, reset)
        .await?;

    let queue_position = state
        .orchestrator
        .enqueue(Job::resume(batch_id, &batch.name))?;

    tracing::info!(
        batch_id = %batch_id,
        reset_items = reset,
        "Force-retry requeued batch"
    );

    Ok(Json(RequeueResponse {
        batch_id,
        queue_position,
        reset_items: Some(reset),
    }))
}

/// GET /api/orchestrator/stats
pub async fn orchestrator_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.orchestrator.stats())
}

/// Build batch routes
pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/api/batches/:id", get(get_batch))
        .route("/api/batches/:id/items", get(list_batch_items))
        .route("/api/batches/:id/resume", post(resume_batch))
        .route("/api/batches/:id/force-retry", post(force_retry_batch))
        .route("/api/orchestrator/stats", get(orchestrator_stats))
}
