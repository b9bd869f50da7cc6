//! Item model
//!
//! One file within a batch, tracked independently through reception and
//! processing. Rows are created in bulk during extraction and mutated only
//! by whichever worker currently owns them; ownership is taken through the
//! conditional claim UPDATE in the items repository.

use crate::services::archive_extractor::ExtractedEntry;
use chrono::{DateTime, Utc};
use pixq_common::status::{ProcessingStatus, ReceptionStatus};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Derived key parsed from the filename
    pub sku: String,
    /// Optional parsed suffix (numeric, single letter, or vocabulary token)
    pub sequence_token: Option<String>,
    pub original_filename: String,
    pub size_bytes: i64,
    /// Hex SHA-256 of the content, set once computed
    pub fingerprint: Option<String>,
    /// Where extraction parked the bytes; needed again on resume
    pub temp_path: Option<PathBuf>,
    pub reception_status: ReceptionStatus,
    pub processing_status: ProcessingStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    /// Unix seconds of the owning worker's last sign of life
    pub heartbeat_at: Option<i64>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    /// Catalog entry created (or joined, for duplicate-skips) by processing
    pub entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Build an item for an accepted archive entry
    ///
    /// Bytes already sit in the extraction work area, so reception starts
    /// at Received; processing starts at Pending.
    pub fn from_entry(batch_id: Uuid, entry: &ExtractedEntry, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            sku: entry.sku.clone(),
            sequence_token: entry.sequence.clone(),
            original_filename: entry.original_filename.clone(),
            size_bytes: entry.size as i64,
            fingerprint: None,
            temp_path: Some(entry.temp_path.clone()),
            reception_status: ReceptionStatus::Received,
            processing_status: ProcessingStatus::Pending,
            retry_count: 0,
            max_retries: max_retries as i64,
            heartbeat_at: None,
            worker_id: None,
            last_error: None,
            entry_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
