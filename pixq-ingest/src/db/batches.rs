//! Batch database operations

use crate::models::Batch;
use anyhow::Result;
use chrono::{DateTime, Utc};
use pixq_common::status::BatchStatus;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// Insert a freshly created batch
pub async fn insert(pool: &SqlitePool, batch: &Batch) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO batches (id, name, status, total_items, processed_items,
                             success_count, failure_count, owner, collection_id,
                             brand_id, error, created_at, started_at, finished_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(batch.id.to_string())
    .bind(&batch.name)
    .bind(batch.status.as_str())
    .bind(batch.total_items)
    .bind(batch.processed_items)
    .bind(batch.success_count)
    .bind(batch.failure_count)
    .bind(&batch.owner)
    .bind(&batch.collection_id)
    .bind(&batch.brand_id)
    .bind(&batch.error)
    .bind(batch.created_at.to_rfc3339())
    .bind(batch.started_at.map(|t| t.to_rfc3339()))
    .bind(batch.finished_at.map(|t| t.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a batch by id
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Batch>> {
    let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| batch_from_row(&r)).transpose()
}

/// Set the batch status
pub async fn set_status(pool: &SqlitePool, id: Uuid, status: BatchStatus) -> Result<()> {
    sqlx::query("UPDATE batches SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Move the batch into Processing and stamp started_at on first entry
pub async fn mark_processing(pool: &SqlitePool, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET status = 'processing',
                            started_at = COALESCE(started_at, ?)
         WHERE id = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the registered item count before processing starts
pub async fn set_total_items(pool: &SqlitePool, id: Uuid, total: i64) -> Result<()> {
    sqlx::query("UPDATE batches SET total_items = ? WHERE id = ?")
        .bind(total)
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Finalize a batch into a terminal status with finished_at and an
/// optional job-level error message
pub async fn finalize(
    pool: &SqlitePool,
    id: Uuid,
    status: BatchStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET status = ?, finished_at = ?, error = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(error)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Conditionally put a batch back in Queued for a resume pass
///
/// Succeeds only from Queued or Failed, so a batch currently being worked
/// cannot be re-enqueued underneath its worker.
pub async fn mark_queued_for_resume(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE batches SET status = 'queued', finished_at = NULL, error = NULL
         WHERE id = ? AND status IN ('queued', 'failed')",
    )
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Count one terminal item outcome
///
/// Single statement so the counter rule `success + failure = processed`
/// holds at every observable point; callers serialize per batch through
/// the progress tracker's lock.
pub async fn record_outcome(pool: &SqlitePool, id: Uuid, success: bool) -> Result<()> {
    let query = if success {
        "UPDATE batches SET processed_items = processed_items + 1,
                            success_count = success_count + 1
         WHERE id = ?"
    } else {
        "UPDATE batches SET processed_items = processed_items + 1,
                            failure_count = failure_count + 1
         WHERE id = ?"
    };

    sqlx::query(query).bind(id.to_string()).execute(pool).await?;

    Ok(())
}

/// Roll counters back when failed items are reset to pending
///
/// The reset items' earlier failure outcomes no longer count; a later pass
/// records their new terminal outcomes.
pub async fn rollback_failures(pool: &SqlitePool, id: Uuid, count: i64) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET processed_items = processed_items - ?,
                            failure_count = failure_count - ?
         WHERE id = ?",
    )
    .bind(count)
    .bind(count)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Batches not in a terminal status, for the startup reconciliation pass
pub async fn list_unfinished(pool: &SqlitePool) -> Result<Vec<Batch>> {
    let rows = sqlx::query(
        "SELECT * FROM batches WHERE status IN ('queued', 'receiving', 'extracting', 'processing')",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(batch_from_row).collect()
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let id_str: String = row.get("id");
    let status_str: String = row.get("status");
    let created_str: String = row.get("created_at");
    let started_str: Option<String> = row.get("started_at");
    let finished_str: Option<String> = row.get("finished_at");

    Ok(Batch {
        id: Uuid::parse_str(&id_str)?,
        name: row.get("name"),
        status: BatchStatus::from_str(&status_str)?,
        total_items: row.get("total_items"),
        processed_items: row.get("processed_items"),
        success_count: row.get("success_count"),
        failure_count: row.get("failure_count"),
        owner: row.get("owner"),
        collection_id: row.get("collection_id"),
        brand_id: row.get("brand_id"),
        error: row.get("error"),
        created_at: parse_timestamp(&created_str)?,
        started_at: started_str.as_deref().map(parse_timestamp).transpose()?,
        finished_at: finished_str.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
