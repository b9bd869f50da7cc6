//! Chunked upload session model
//!
//! Sessions are ephemeral: they live in the intake service's in-memory map
//! until `complete()` succeeds, terminally fails, or the TTL sweep discards
//! them. Only the assembled archive and the batch row survive.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

/// Metadata supplied when finalizing an upload into a batch
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UploadMeta {
    /// Display name for the batch; falls back to the archive filename
    pub name: Option<String>,
    pub owner: Option<String>,
    pub collection_id: Option<String>,
    pub brand_id: Option<String>,
}

#[derive(Debug)]
pub struct UploadSession {
    pub upload_id: Uuid,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    /// ceil(total_size / chunk_size); indices run 0..expected_chunks
    pub expected_chunks: u32,
    pub received: HashSet<u32>,
    pub chunk_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(filename: String, total_size: u64, chunk_size: u64, chunk_dir: PathBuf) -> Self {
        let expected_chunks = total_size.div_ceil(chunk_size) as u32;
        Self {
            upload_id: Uuid::new_v4(),
            filename,
            total_size,
            chunk_size,
            expected_chunks,
            received: HashSet::new(),
            chunk_dir,
            created_at: Utc::now(),
        }
    }

    /// Count of expected indices not yet received
    pub fn missing_count(&self) -> usize {
        (0..self.expected_chunks)
            .filter(|i| !self.received.contains(i))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// On-disk name for one chunk, zero padded so a directory listing sorts
    pub fn chunk_file(&self, index: u32) -> PathBuf {
        self.chunk_dir.join(format!("chunk_{:06}", index))
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}
