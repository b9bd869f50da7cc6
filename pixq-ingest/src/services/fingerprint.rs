//! Content fingerprinting and duplicate detection
//!
//! Calculates the SHA-256 fingerprint of extracted files and tracks which
//! fingerprints have already been stored, so identical bytes are uploaded
//! once no matter how many archives carry them.

use pixq_common::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// Calculate the SHA-256 fingerprint of a file
///
/// Reads in 1MB chunks on a blocking thread so multi-megabyte images never
/// hold a whole buffer in memory or stall the async runtime.
pub async fn calculate_fingerprint(file_path: &Path) -> Result<String> {
    let path = file_path.to_path_buf();
    tracing::debug!(path = %path.display(), "Calculating SHA-256 fingerprint");

    let hash = tokio::task::spawn_blocking(move || -> Result<String> {
        use std::fs::File;
        use std::io::Read;

        let mut file = File::open(&path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open file for fingerprinting: {}", e),
            ))
        })?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let bytes_read = file.read(&mut buffer).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read file for fingerprinting: {}", e),
                ))
            })?;

            if bytes_read == 0 {
                break;
            }

            hasher.update(&buffer[..bytes_read]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Internal(format!("Fingerprint task failed: {}", e)))??;

    Ok(hash)
}

/// In-memory set of fingerprints already seen
///
/// The orchestrator decides its lifetime: one shared index warmed from the
/// catalog at startup (process scope), or a fresh index per job (batch
/// scope). `check_and_insert` is the only mutation, so two workers hashing
/// identical bytes concurrently cannot both win.
#[derive(Debug, Default)]
pub struct FingerprintIndex {
    seen: Mutex<HashSet<String>>,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload every fingerprint the catalog already knows
    pub async fn warm(&self, pool: &SqlitePool) -> Result<usize> {
        let fingerprints = crate::db::catalog::all_fingerprints(pool)
            .await
            .map_err(|e| Error::Internal(format!("Failed to warm fingerprint index: {}", e)))?;

        let count = fingerprints.len();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.extend(fingerprints);

        tracing::info!(count = count, "Warmed fingerprint index");
        Ok(count)
    }

    /// Record a fingerprint; returns true when it is the first sighting
    pub fn check_and_insert(&self, fingerprint: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(fingerprint.to_string())
    }

    /// Release a fingerprint whose item did not reach the catalog
    ///
    /// Without this, a failed first sighting would make every later copy
    /// of the same bytes complete as a duplicate of nothing.
    pub fn remove(&self, fingerprint: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.remove(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn fingerprint_matches_known_digest() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"test content").unwrap();
        temp_file.flush().unwrap();

        let fingerprint = calculate_fingerprint(temp_file.path()).await.unwrap();

        assert_eq!(fingerprint.len(), 64);
        let expected = format!("{:x}", Sha256::digest(b"test content"));
        assert_eq!(fingerprint, expected);
    }

    #[tokio::test]
    async fn fingerprint_missing_file_is_io_error() {
        let result = calculate_fingerprint(Path::new("/nonexistent/image.jpg")).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn index_reports_first_sighting_once() {
        let index = FingerprintIndex::new();

        assert!(index.check_and_insert("aa11"));
        assert!(!index.check_and_insert("aa11"));
        assert!(index.check_and_insert("bb22"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn removed_fingerprint_counts_as_first_sighting_again() {
        let index = FingerprintIndex::new();

        assert!(index.check_and_insert("aa11"));
        index.remove("aa11");
        assert!(index.check_and_insert("aa11"));
    }

    #[tokio::test]
    async fn warm_loads_catalog_fingerprints() {
        let pool = sqlx::SqlitePool::connect(":memory:").await.unwrap();
        pixq_common::db::init::create_batches_table(&pool).await.unwrap();
        pixq_common::db::init::create_catalog_entries_table(&pool).await.unwrap();

        let batch = crate::models::Batch::new("warm", Default::default());
        crate::db::batches::insert(&pool, &batch).await.unwrap();
        let entry = crate::db::catalog::CatalogEntry::new(
            "SKU-1".to_string(),
            "obj-1".to_string(),
            "SKU-1.jpg".to_string(),
            "cafe01".to_string(),
            "SKU-1.jpg".to_string(),
            batch.id,
        );
        crate::db::catalog::insert(&pool, &entry).await.unwrap();

        let index = FingerprintIndex::new();
        let count = index.warm(&pool).await.unwrap();

        assert_eq!(count, 1);
        assert!(!index.check_and_insert("cafe01"));
    }
}
