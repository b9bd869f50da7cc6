//! Catalog entry database operations
//!
//! Catalog entries are the durable output of the pipeline: one row per
//! stored object, linking the SKU, the object store location, and the
//! reference-data match outcome.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

/// Durable record of one ingested image
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub sku: String,
    /// Identifier assigned by the object store
    pub object_id: String,
    /// Name the object was stored under
    pub object_name: String,
    pub fingerprint: String,
    /// Whether reference data matched the SKU
    pub matched: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub original_filename: String,
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn new(
        sku: String,
        object_id: String,
        object_name: String,
        fingerprint: String,
        original_filename: String,
        batch_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sku,
            object_id,
            object_name,
            fingerprint,
            matched: false,
            title: None,
            description: None,
            original_filename,
            batch_id,
            created_at: Utc::now(),
        }
    }
}

/// Save a catalog entry
pub async fn insert(pool: &SqlitePool, entry: &CatalogEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO catalog_entries (id, sku, object_id, object_name, fingerprint,
                                     matched, title, description, original_filename,
                                     batch_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.id.to_string())
    .bind(&entry.sku)
    .bind(&entry.object_id)
    .bind(&entry.object_name)
    .bind(&entry.fingerprint)
    .bind(entry.matched)
    .bind(&entry.title)
    .bind(&entry.description)
    .bind(&entry.original_filename)
    .bind(entry.batch_id.to_string())
    .bind(entry.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a catalog entry by id
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<CatalogEntry>> {
    let row = sqlx::query("SELECT * FROM catalog_entries WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| entry_from_row(&r)).transpose()
}

/// Look up the existing entry for a fingerprint (deduplication)
pub async fn find_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &str,
) -> Result<Option<CatalogEntry>> {
    let row = sqlx::query("SELECT * FROM catalog_entries WHERE fingerprint = ? LIMIT 1")
        .bind(fingerprint)
        .fetch_optional(pool)
        .await?;

    row.map(|r| entry_from_row(&r)).transpose()
}

/// Entries created by one batch
pub async fn list_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<CatalogEntry>> {
    let rows = sqlx::query("SELECT * FROM catalog_entries WHERE batch_id = ? ORDER BY created_at")
        .bind(batch_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// All known fingerprints, used to warm the in-memory duplicate index
pub async fn all_fingerprints(pool: &SqlitePool) -> Result<Vec<String>> {
    let fingerprints: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT fingerprint FROM catalog_entries")
            .fetch_all(pool)
            .await?;

    Ok(fingerprints)
}

fn entry_from_row(row: &SqliteRow) -> Result<CatalogEntry> {
    let id_str: String = row.get("id");
    let batch_str: String = row.get("batch_id");
    let created_str: String = row.get("created_at");

    Ok(CatalogEntry {
        id: Uuid::parse_str(&id_str)?,
        sku: row.get("sku"),
        object_id: row.get("object_id"),
        object_name: row.get("object_name"),
        fingerprint: row.get("fingerprint"),
        matched: row.get("matched"),
        title: row.get("title"),
        description: row.get("description"),
        original_filename: row.get("original_filename"),
        batch_id: Uuid::parse_str(&batch_str)?,
        created_at: DateTime::parse_from_rfc3339(&created_str)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batch::BatchMeta;
    use crate::models::Batch;
    use sqlx::SqlitePool;

    async fn test_pool() -> (SqlitePool, Uuid) {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        pixq_common::db::init::create_batches_table(&pool).await.unwrap();
        pixq_common::db::init::create_catalog_entries_table(&pool).await.unwrap();

        let batch = Batch::new("test", BatchMeta::default());
        crate::db::batches::insert(&pool, &batch).await.unwrap();
        (pool, batch.id)
    }

    #[tokio::test]
    async fn insert_and_find_by_fingerprint() {
        let (pool, batch_id) = test_pool().await;

        let mut entry = CatalogEntry::new(
            "ABC-123".to_string(),
            "obj-9".to_string(),
            "ABC-123_front.jpg".to_string(),
            "aa11".to_string(),
            "ABC-123_front.jpg".to_string(),
            batch_id,
        );
        entry.matched = true;
        entry.title = Some("Red chair".to_string());
        insert(&pool, &entry).await.unwrap();

        let found = find_by_fingerprint(&pool, "aa11").await.unwrap().unwrap();
        assert_eq!(found.id, entry.id);
        assert_eq!(found.sku, "ABC-123");
        assert!(found.matched);
        assert_eq!(found.title.as_deref(), Some("Red chair"));

        assert!(find_by_fingerprint(&pool, "bb22").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn all_fingerprints_deduplicates() {
        let (pool, batch_id) = test_pool().await;

        for (name, fp) in [("a.jpg", "f1"), ("b.jpg", "f2"), ("c.jpg", "f1")] {
            let entry = CatalogEntry::new(
                "SKU-1".to_string(),
                format!("obj-{}", name),
                name.to_string(),
                fp.to_string(),
                name.to_string(),
                batch_id,
            );
            insert(&pool, &entry).await.unwrap();
        }

        let mut fps = all_fingerprints(&pool).await.unwrap();
        fps.sort();
        assert_eq!(fps, vec!["f1".to_string(), "f2".to_string()]);
    }
}
