//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up
//! idempotently on every start. All tables use `CREATE TABLE IF NOT EXISTS`
//! so restarts and tests can call this freely.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version, recorded in the settings table
pub const SCHEMA_VERSION: &str = "1";

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers with one writer, which the worker pool
    // and watchdog rely on
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    // Migrations (idempotent, safe to call multiple times)
    create_settings_table(&pool).await?;
    create_batches_table(&pool).await?;
    create_items_table(&pool).await?;
    create_catalog_entries_table(&pool).await?;

    ensure_setting(&pool, "schema_version", SCHEMA_VERSION).await?;

    Ok(pool)
}

/// Create the settings table
///
/// Stores application key-value pairs (schema version and small
/// operational markers).
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the batches table
///
/// One row per user-submitted ingestion request. The counter CHECK
/// constraints encode the progress accounting rule: counters advance one
/// terminal item at a time in single UPDATE statements, so
/// `success + failure = processed <= total` holds at every point the
/// database is observable.
pub async fn create_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued'
                CHECK (status IN ('queued', 'receiving', 'extracting', 'processing', 'completed', 'failed')),
            total_items INTEGER NOT NULL DEFAULT 0 CHECK (total_items >= 0),
            processed_items INTEGER NOT NULL DEFAULT 0 CHECK (processed_items >= 0),
            success_count INTEGER NOT NULL DEFAULT 0 CHECK (success_count >= 0),
            failure_count INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
            owner TEXT,
            collection_id TEXT,
            brand_id TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            CHECK (processed_items <= total_items),
            CHECK (success_count + failure_count = processed_items)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the items table
///
/// One row per file within a batch. `heartbeat_at` is unix seconds so the
/// watchdog's staleness comparison runs numerically inside the conditional
/// UPDATE.
pub async fn create_items_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(id),
            sku TEXT NOT NULL,
            sequence_token TEXT,
            original_filename TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0 CHECK (size_bytes >= 0),
            fingerprint TEXT,
            temp_path TEXT,
            reception_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (reception_status IN ('pending', 'receiving', 'received', 'uploaded', 'failed')),
            processing_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (processing_status IN ('pending', 'processing', 'completed', 'retry', 'failed', 'orphaned')),
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
            heartbeat_at INTEGER,
            worker_id TEXT,
            last_error TEXT,
            entry_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_batch_id ON items(batch_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_items_processing_status ON items(processing_status)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_fingerprint ON items(fingerprint)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the catalog_entries table
///
/// The durable result record linking an item to its stored object and its
/// reference-data match outcome. Duplicate-skipped items point at the
/// existing entry for their fingerprint instead of creating a second row.
pub async fn create_catalog_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_entries (
            id TEXT PRIMARY KEY,
            sku TEXT NOT NULL,
            object_id TEXT NOT NULL,
            object_name TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            matched INTEGER NOT NULL DEFAULT 0,
            title TEXT,
            description TEXT,
            original_filename TEXT NOT NULL,
            batch_id TEXT NOT NULL REFERENCES batches(id),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_entries_sku ON catalog_entries(sku)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_catalog_entries_fingerprint ON catalog_entries(fingerprint)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // INSERT OR IGNORE handles concurrent initialization races: multiple
        // callers may pass the exists check simultaneously
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        info!("Reset NULL setting '{}' to default value: {}", key, default_value);
    }

    Ok(())
}

/// Read a setting value
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value.flatten())
}
