//! Chunked upload endpoints
//!
//! POST /api/uploads, PUT /api/uploads/:id/chunks/:index,
//! POST /api/uploads/:id/complete

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::upload::UploadMeta;
use crate::services::upload_intake;
use crate::AppState;

/// POST /api/uploads request
#[derive(Debug, Deserialize)]
pub struct InitUploadRequest {
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
}

/// POST /api/uploads response
#[derive(Debug, Serialize)]
pub struct InitUploadResponse {
    pub upload_id: Uuid,
    /// Expected chunk indices run 0..chunk_count
    pub chunk_count: u32,
}

/// POST /api/uploads
pub async fn init_upload(
    State(state): State<AppState>,
    Json(request): Json<InitUploadRequest>,
) -> ApiResult<Json<InitUploadResponse>> {
    let (upload_id, chunk_count) = state
        .intake
        .init(&request.filename, request.total_size, request.chunk_size)
        .await?;

    Ok(Json(InitUploadResponse {
        upload_id,
        chunk_count,
    }))
}

/// PUT /api/uploads/:id/chunks/:index
///
/// Raw chunk bytes in the body; safe to call concurrently and out of
/// order. Returns 204.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(Uuid, u32)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("chunk body is empty".to_string()));
    }

    state.intake.put_chunk(upload_id, index, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/uploads/:id/complete
///
/// Verifies all chunks arrived, assembles the archive, creates the batch
/// and enqueues its job. Fails with 400 naming the exact missing-chunk
/// count; either way the upload session is discarded.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
    meta: Option<Json<UploadMeta>>,
) -> ApiResult<Json<upload_intake::CompletedUpload>> {
    let meta = meta.map(|Json(m)| m).unwrap_or_default();

    let completed = upload_intake::complete(
        &state.intake,
        &state.db,
        &state.orchestrator,
        upload_id,
        meta,
    )
    .await?;

    Ok(Json(completed))
}

/// Build upload routes
pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/api/uploads", post(init_upload))
        .route("/api/uploads/:id/chunks/:index", put(put_chunk))
        .route("/api/uploads/:id/complete", post(complete_upload))
}
