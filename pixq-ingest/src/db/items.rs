//! Item database operations
//!
//! Ownership of an item is decided by the database: workers take items
//! through `claim` (a conditional UPDATE from pending/retry), and every
//! transition out of processing is guarded on the status still being
//! `processing`. Whichever actor wins the UPDATE owns the transition; the
//! loser sees zero rows affected and must not count the outcome.

use crate::models::Item;
use anyhow::Result;
use chrono::{DateTime, Utc};
use pixq_common::status::{ProcessingStatus, ReceptionStatus};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Rows per INSERT transaction during bulk registration
const INSERT_CHUNK_SIZE: usize = 500;

/// Register extracted items in bulk
///
/// Inserts in chunks of 500 rows, one transaction per chunk, so very large
/// archives neither build one giant transaction nor pay per-row commit
/// costs.
pub async fn bulk_insert(pool: &SqlitePool, items: &[Item]) -> Result<()> {
    for chunk in items.chunks(INSERT_CHUNK_SIZE) {
        let mut tx = pool.begin().await?;

        for item in chunk {
            sqlx::query(
                r#"
                INSERT INTO items (id, batch_id, sku, sequence_token, original_filename,
                                   size_bytes, fingerprint, temp_path, reception_status,
                                   processing_status, retry_count, max_retries, heartbeat_at,
                                   worker_id, last_error, entry_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.id.to_string())
            .bind(item.batch_id.to_string())
            .bind(&item.sku)
            .bind(&item.sequence_token)
            .bind(&item.original_filename)
            .bind(item.size_bytes)
            .bind(&item.fingerprint)
            .bind(item.temp_path.as_ref().map(|p| p.display().to_string()))
            .bind(item.reception_status.as_str())
            .bind(item.processing_status.as_str())
            .bind(item.retry_count)
            .bind(item.max_retries)
            .bind(item.heartbeat_at)
            .bind(&item.worker_id)
            .bind(&item.last_error)
            .bind(item.entry_id.map(|id| id.to_string()))
            .bind(item.created_at.to_rfc3339())
            .bind(item.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
    }

    Ok(())
}

/// Load an item by id
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Item>> {
    let row = sqlx::query("SELECT * FROM items WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| item_from_row(&r)).transpose()
}

/// All items of a batch
pub async fn list_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<Item>> {
    let rows = sqlx::query("SELECT * FROM items WHERE batch_id = ? ORDER BY created_at, id")
        .bind(batch_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(item_from_row).collect()
}

/// Items of a batch in one processing status
pub async fn list_for_batch_with_status(
    pool: &SqlitePool,
    batch_id: Uuid,
    status: ProcessingStatus,
) -> Result<Vec<Item>> {
    let rows = sqlx::query(
        "SELECT * FROM items WHERE batch_id = ? AND processing_status = ? ORDER BY created_at, id",
    )
    .bind(batch_id.to_string())
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Items a processing pass should pick up: pending or retry
pub async fn load_resumable(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<Item>> {
    let rows = sqlx::query(
        "SELECT * FROM items WHERE batch_id = ?
         AND processing_status IN ('pending', 'retry')
         ORDER BY created_at, id",
    )
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Count of pending/retry items, used for batch finalization
pub async fn count_resumable(pool: &SqlitePool, batch_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM items WHERE batch_id = ?
         AND processing_status IN ('pending', 'retry')",
    )
    .bind(batch_id.to_string())
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Claim an item for processing
///
/// Conditional UPDATE from pending/retry; returns false when another
/// worker already owns it or it reached a terminal status.
pub async fn claim(pool: &SqlitePool, id: Uuid, worker_id: &str, now_epoch: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'processing', worker_id = ?,
                          heartbeat_at = ?, updated_at = ?
         WHERE id = ? AND processing_status IN ('pending', 'retry')",
    )
    .bind(worker_id)
    .bind(now_epoch)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Refresh the owning worker's heartbeat
pub async fn heartbeat(pool: &SqlitePool, id: Uuid, now_epoch: i64) -> Result<()> {
    sqlx::query(
        "UPDATE items SET heartbeat_at = ? WHERE id = ? AND processing_status = 'processing'",
    )
    .bind(now_epoch)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Complete an item whose bytes were uploaded and recorded
///
/// Guarded on the item still being in processing; returns false when the
/// watchdog requeued it underneath the worker (the outcome then belongs to
/// a later pass).
pub async fn complete_uploaded(
    pool: &SqlitePool,
    id: Uuid,
    entry_id: Uuid,
    fingerprint: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'completed', reception_status = 'uploaded',
                          entry_id = ?, fingerprint = ?, last_error = NULL,
                          worker_id = NULL, heartbeat_at = NULL, updated_at = ?
         WHERE id = ? AND processing_status = 'processing'",
    )
    .bind(entry_id.to_string())
    .bind(fingerprint)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Complete an item as a duplicate-skip
///
/// No upload happened, so reception stays as received; the entry id points
/// at the existing catalog entry for the fingerprint when one exists.
pub async fn complete_duplicate(
    pool: &SqlitePool,
    id: Uuid,
    fingerprint: &str,
    entry_id: Option<Uuid>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'completed', entry_id = ?,
                          fingerprint = ?, last_error = NULL,
                          worker_id = NULL, heartbeat_at = NULL, updated_at = ?
         WHERE id = ? AND processing_status = 'processing'",
    )
    .bind(entry_id.map(|e| e.to_string()))
    .bind(fingerprint)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record a failed processing step
///
/// One statement decides retry versus failed from the retry budget, so the
/// watchdog and the worker can never both advance the count. Returns the
/// resulting status, or None when the item was no longer owned.
pub async fn fail_step(
    pool: &SqlitePool,
    id: Uuid,
    error: &str,
) -> Result<Option<ProcessingStatus>> {
    let result = sqlx::query(
        "UPDATE items SET
            processing_status = CASE WHEN retry_count + 1 >= max_retries
                                     THEN 'failed' ELSE 'retry' END,
            retry_count = retry_count + 1,
            last_error = ?,
            worker_id = NULL,
            heartbeat_at = NULL,
            updated_at = ?
         WHERE id = ? AND processing_status = 'processing'",
    )
    .bind(error)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let status: String =
        sqlx::query_scalar("SELECT processing_status FROM items WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(pool)
            .await?;

    Ok(Some(ProcessingStatus::from_str(&status)?))
}

/// Mark an item whose source bytes are irrecoverably missing
pub async fn mark_orphaned(pool: &SqlitePool, id: Uuid, error: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'orphaned', last_error = ?,
                          worker_id = NULL, heartbeat_at = NULL, updated_at = ?
         WHERE id = ? AND processing_status = 'processing'",
    )
    .bind(error)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Force-retry support: reset this batch's failed items to pending
///
/// Returns the number of rows reset so the caller can roll the batch
/// counters back by the same amount.
pub async fn reset_failed_to_pending(pool: &SqlitePool, batch_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'pending', retry_count = 0,
                          last_error = NULL, worker_id = NULL, heartbeat_at = NULL,
                          updated_at = ?
         WHERE batch_id = ? AND processing_status = 'failed'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(batch_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Startup pass: items interrupted during reception cannot be recovered
///
/// Returns the owning batch id of each item marked failed, one entry per
/// item, so the caller can count the failure outcomes.
pub async fn recover_interrupted_receiving(pool: &SqlitePool) -> Result<Vec<Uuid>> {
    let rows = sqlx::query("SELECT batch_id FROM items WHERE reception_status = 'receiving'")
        .fetch_all(pool)
        .await?;

    let batch_ids = rows
        .iter()
        .map(|row| {
            let batch_str: String = row.get("batch_id");
            Ok(Uuid::parse_str(&batch_str)?)
        })
        .collect::<Result<Vec<Uuid>>>()?;

    if !batch_ids.is_empty() {
        sqlx::query(
            "UPDATE items SET reception_status = 'failed', processing_status = 'failed',
                              last_error = 'interrupted during reception', updated_at = ?
             WHERE reception_status = 'receiving'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    }

    Ok(batch_ids)
}

/// Startup pass: items a dead process left in processing go back to retry
pub async fn recover_interrupted_processing(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'retry', retry_count = retry_count + 1,
                          worker_id = NULL, heartbeat_at = NULL, updated_at = ?
         WHERE processing_status = 'processing'",
    )
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Candidates for the steady-state stuck check
pub async fn list_stale_processing(pool: &SqlitePool, threshold_epoch: i64) -> Result<Vec<Item>> {
    let rows = sqlx::query(
        "SELECT * FROM items WHERE processing_status = 'processing' AND heartbeat_at < ?",
    )
    .bind(threshold_epoch)
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Requeue one stuck item (CAS: still processing, heartbeat still stale,
/// retries remain)
pub async fn requeue_stale(pool: &SqlitePool, id: Uuid, threshold_epoch: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'retry', retry_count = retry_count + 1,
                          worker_id = NULL, heartbeat_at = NULL, updated_at = ?
         WHERE id = ? AND processing_status = 'processing'
           AND heartbeat_at < ? AND retry_count < max_retries",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(threshold_epoch)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Fail one stuck item that exhausted its retries (CAS as above)
pub async fn fail_stale(pool: &SqlitePool, id: Uuid, threshold_epoch: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE items SET processing_status = 'failed', last_error = 'stuck processing timeout',
                          worker_id = NULL, heartbeat_at = NULL, updated_at = ?
         WHERE id = ? AND processing_status = 'processing'
           AND heartbeat_at < ? AND retry_count >= max_retries",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(threshold_epoch)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let id_str: String = row.get("id");
    let batch_str: String = row.get("batch_id");
    let reception_str: String = row.get("reception_status");
    let processing_str: String = row.get("processing_status");
    let temp_path: Option<String> = row.get("temp_path");
    let entry_str: Option<String> = row.get("entry_id");
    let created_str: String = row.get("created_at");
    let updated_str: String = row.get("updated_at");

    Ok(Item {
        id: Uuid::parse_str(&id_str)?,
        batch_id: Uuid::parse_str(&batch_str)?,
        sku: row.get("sku"),
        sequence_token: row.get("sequence_token"),
        original_filename: row.get("original_filename"),
        size_bytes: row.get("size_bytes"),
        fingerprint: row.get("fingerprint"),
        temp_path: temp_path.map(PathBuf::from),
        reception_status: ReceptionStatus::from_str(&reception_str)?,
        processing_status: ProcessingStatus::from_str(&processing_str)?,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        heartbeat_at: row.get("heartbeat_at"),
        worker_id: row.get("worker_id"),
        last_error: row.get("last_error"),
        entry_id: entry_str.as_deref().map(Uuid::parse_str).transpose()?,
        created_at: parse_timestamp(&created_str)?,
        updated_at: parse_timestamp(&updated_str)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
