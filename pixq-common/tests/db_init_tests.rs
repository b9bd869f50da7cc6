//! Integration tests for database initialization
//!
//! Covers automatic creation on first run, idempotent reopening, schema
//! constraints, and the schema version marker.

use pixq_common::db::init::{get_setting, init_database};
use tempfile::TempDir;

#[tokio::test]
async fn creates_database_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("pixq.db");
    assert!(!db_path.exists());

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists(), "Database file was not created");

    let version = get_setting(&pool, "schema_version").await.unwrap();
    assert_eq!(version.as_deref(), Some("1"));
}

#[tokio::test]
async fn reopens_existing_database() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("pixq.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    // Second init must succeed against the existing file
    let pool2 = init_database(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batches")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn batch_counter_constraints_enforced() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("pixq.db");
    let pool = init_database(&db_path).await.unwrap();

    // processed > total violates the counter CHECK
    let result = sqlx::query(
        "INSERT INTO batches (id, name, status, total_items, processed_items, success_count, failure_count, created_at)
         VALUES ('b1', 'bad', 'queued', 1, 2, 2, 0, '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err());

    // success + failure must equal processed
    let result = sqlx::query(
        "INSERT INTO batches (id, name, status, total_items, processed_items, success_count, failure_count, created_at)
         VALUES ('b2', 'bad', 'queued', 5, 2, 0, 0, '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn status_checks_reject_unknown_values() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("pixq.db");
    let pool = init_database(&db_path).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO batches (id, name, status, created_at)
         VALUES ('b1', 'bad-status', 'exploded', '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "CHECK constraint should reject unknown status");
}

#[tokio::test]
async fn items_require_existing_batch() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("pixq.db");
    let pool = init_database(&db_path).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO items (id, batch_id, sku, original_filename, created_at, updated_at)
         VALUES ('i1', 'no-such-batch', 'SKU-1', 'a.jpg', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "Foreign key should reject orphan item rows");
}
