//! Per-item processing
//!
//! Drives one item through fingerprint, dedup check, reference lookup,
//! upload, and catalog recording. Every error is caught at this boundary
//! and mapped onto the item's status; nothing propagates into the worker
//! loop, so one corrupt file can never abort its siblings.
//!
//! Error categories and where they land: transient I/O (storage or
//! reference hiccups) consumes a retry; missing source bytes orphan the
//! item; a reference lookup miss is not an error at all; unparseable
//! filenames never reach this module (extraction drops them); archive
//! failures are handled at the job boundary by the orchestrator.

use crate::db::catalog::CatalogEntry;
use crate::models::Item;
use crate::services::fingerprint::{calculate_fingerprint, FingerprintIndex};
use crate::services::reference_client::ReferenceLookup;
use crate::services::storage_client::{content_type_for, ObjectStore, StoredObject};
use chrono::Utc;
use pixq_common::Error;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Error that ends one processing attempt
#[derive(Debug, thiserror::Error)]
enum ItemError {
    /// Storage or network hiccup; consumes a retry
    #[error("{0}")]
    TransientIo(String),

    /// Source bytes are gone; the item is orphaned, terminal
    #[error("{0}")]
    ResourceMissing(String),
}

/// What happened to one claimed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Uploaded and recorded in the catalog
    Completed,
    /// Byte-identical content already stored; counted as success
    DuplicateSkip,
    /// Attempt failed, retries remain
    Retried,
    /// Attempt failed, retries exhausted
    Failed,
    /// Source bytes missing, terminal
    Orphaned,
    /// Item was not ours to process (claim lost or already terminal)
    Skipped,
}

impl ProcessOutcome {
    /// Terminal success, for the orchestrator's aggregate stats
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Completed | ProcessOutcome::DuplicateSkip)
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, ProcessOutcome::Failed | ProcessOutcome::Orphaned)
    }
}

enum PipelineResult {
    Stored { entry_id: Uuid, fingerprint: String },
    Duplicate { entry_id: Option<Uuid>, fingerprint: String },
}

pub struct ItemProcessor {
    db: SqlitePool,
    store: Arc<dyn ObjectStore>,
    reference: Arc<dyn ReferenceLookup>,
    fingerprints: Arc<FingerprintIndex>,
    progress: Arc<crate::services::progress::ProgressTracker>,
    upload_attempts: u32,
    retry_delay: Duration,
}

impl ItemProcessor {
    pub fn new(
        db: SqlitePool,
        store: Arc<dyn ObjectStore>,
        reference: Arc<dyn ReferenceLookup>,
        fingerprints: Arc<FingerprintIndex>,
        progress: Arc<crate::services::progress::ProgressTracker>,
        upload_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            db,
            store,
            reference,
            fingerprints,
            progress,
            upload_attempts: upload_attempts.max(1),
            retry_delay,
        }
    }

    /// Claim and process one item to a terminal or resumable status
    ///
    /// Never returns an error: every failure is recorded on the item row
    /// and folded into the returned outcome.
    pub async fn process_one(&self, item: &Item, worker_id: &str) -> ProcessOutcome {
        let claimed = match crate::db::items::claim(
            &self.db,
            item.id,
            worker_id,
            Utc::now().timestamp(),
        )
        .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Claim query failed");
                return ProcessOutcome::Skipped;
            }
        };
        if !claimed {
            debug!(item_id = %item.id, "Item already owned or terminal, skipping");
            return ProcessOutcome::Skipped;
        }

        match self.run_pipeline(item).await {
            Ok(PipelineResult::Stored { entry_id, fingerprint }) => {
                self.settle(
                    item,
                    crate::db::items::complete_uploaded(&self.db, item.id, entry_id, &fingerprint)
                        .await,
                    true,
                    ProcessOutcome::Completed,
                )
                .await
            }
            Ok(PipelineResult::Duplicate { entry_id, fingerprint }) => {
                debug!(item_id = %item.id, fingerprint = %fingerprint, "Duplicate content, skipping upload");
                self.settle(
                    item,
                    crate::db::items::complete_duplicate(&self.db, item.id, &fingerprint, entry_id)
                        .await,
                    true,
                    ProcessOutcome::DuplicateSkip,
                )
                .await
            }
            Err(ItemError::ResourceMissing(msg)) => {
                warn!(item_id = %item.id, error = %msg, "Source bytes missing, orphaning item");
                self.settle(
                    item,
                    crate::db::items::mark_orphaned(&self.db, item.id, &msg).await,
                    false,
                    ProcessOutcome::Orphaned,
                )
                .await
            }
            Err(ItemError::TransientIo(msg)) => {
                warn!(item_id = %item.id, error = %msg, "Item attempt failed");
                match crate::db::items::fail_step(&self.db, item.id, &msg).await {
                    Ok(Some(pixq_common::status::ProcessingStatus::Failed)) => {
                        self.record(item, false).await;
                        ProcessOutcome::Failed
                    }
                    Ok(Some(_)) => ProcessOutcome::Retried,
                    Ok(None) => ProcessOutcome::Skipped,
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "Failed to record item error");
                        ProcessOutcome::Skipped
                    }
                }
            }
        }
    }

    /// Apply a guarded terminal update's result to the counters
    ///
    /// A false update means the watchdog took the item away mid-flight;
    /// the outcome then belongs to whichever pass processes it next.
    async fn settle(
        &self,
        item: &Item,
        update: anyhow::Result<bool>,
        success: bool,
        outcome: ProcessOutcome,
    ) -> ProcessOutcome {
        match update {
            Ok(true) => {
                self.record(item, success).await;
                outcome
            }
            Ok(false) => {
                debug!(item_id = %item.id, "Lost ownership before terminal update");
                ProcessOutcome::Skipped
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Terminal update failed");
                ProcessOutcome::Skipped
            }
        }
    }

    async fn record(&self, item: &Item, success: bool) {
        if let Err(e) = self
            .progress
            .record_outcome(&self.db, item.batch_id, success)
            .await
        {
            warn!(batch_id = %item.batch_id, error = %e, "Failed to record outcome");
        }
    }

    async fn run_pipeline(&self, item: &Item) -> Result<PipelineResult, ItemError> {
        let temp_path = item
            .temp_path
            .clone()
            .ok_or_else(|| ItemError::ResourceMissing("item has no temp path".to_string()))?;

        let fingerprint = match calculate_fingerprint(&temp_path).await {
            Ok(fp) => fp,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ItemError::ResourceMissing(format!(
                    "temp file missing: {}",
                    temp_path.display()
                )));
            }
            Err(e) => return Err(ItemError::TransientIo(e.to_string())),
        };

        if !self.fingerprints.check_and_insert(&fingerprint) {
            let entry_id = crate::db::catalog::find_by_fingerprint(&self.db, &fingerprint)
                .await
                .map_err(|e| ItemError::TransientIo(e.to_string()))?
                .map(|entry| entry.id);
            return Ok(PipelineResult::Duplicate { entry_id, fingerprint });
        }

        // First sighting reserved; release it if anything below fails so a
        // later copy of these bytes can still be stored
        match self.store_and_record(item, &temp_path, &fingerprint).await {
            Ok(entry_id) => Ok(PipelineResult::Stored { entry_id, fingerprint }),
            Err(e) => {
                self.fingerprints.remove(&fingerprint);
                Err(e)
            }
        }
    }

    async fn store_and_record(
        &self,
        item: &Item,
        temp_path: &std::path::Path,
        fingerprint: &str,
    ) -> Result<Uuid, ItemError> {
        let reference = self
            .reference
            .lookup(&item.sku)
            .await
            .map_err(|e| ItemError::TransientIo(e.to_string()))?;

        let bytes = tokio::fs::read(temp_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ItemError::ResourceMissing(format!("temp file missing: {}", temp_path.display()))
            } else {
                ItemError::TransientIo(format!("failed to read temp file: {}", e))
            }
        })?;

        let object_name = object_name_for(item);
        let stored = self.upload_with_retry(item.id, &object_name, bytes).await?;

        let mut entry = CatalogEntry::new(
            item.sku.clone(),
            stored.object_id,
            stored.object_name,
            fingerprint.to_string(),
            item.original_filename.clone(),
            item.batch_id,
        );
        if let Some(reference) = reference {
            entry.matched = true;
            entry.title = reference.title;
            entry.description = reference.description;
        }

        crate::db::catalog::insert(&self.db, &entry)
            .await
            .map_err(|e| ItemError::TransientIo(format!("catalog insert failed: {}", e)))?;

        Ok(entry.id)
    }

    /// Upload with bounded attempts and linear backoff
    ///
    /// Refreshes the item heartbeat before each attempt so a slow but
    /// live upload is not mistaken for a stuck worker.
    async fn upload_with_retry(
        &self,
        item_id: Uuid,
        object_name: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, ItemError> {
        let content_type = content_type_for(object_name);
        let mut last_error = String::new();

        for attempt in 1..=self.upload_attempts {
            if let Err(e) =
                crate::db::items::heartbeat(&self.db, item_id, Utc::now().timestamp()).await
            {
                warn!(item_id = %item_id, error = %e, "Heartbeat refresh failed");
            }

            match self.store.put(object_name, bytes.clone(), content_type).await {
                Ok(stored) => return Ok(stored),
                Err(e) => {
                    warn!(
                        item_id = %item_id,
                        object = %object_name,
                        attempt = attempt,
                        error = %e,
                        "Upload attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < self.upload_attempts {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }

        Err(ItemError::TransientIo(format!(
            "upload failed after {} attempts: {}",
            self.upload_attempts, last_error
        )))
    }
}

/// Object name following the `<KEY>[_<SEQ>].<ext>` convention
fn object_name_for(item: &Item) -> String {
    let ext = item
        .original_filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string());

    match &item.sequence_token {
        Some(seq) => format!("{}_{}.{}", item.sku, seq, ext),
        None => format!("{}.{}", item.sku, ext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Batch, BatchMeta};
    use crate::services::archive_extractor::ExtractedEntry;
    use crate::services::progress::ProgressTracker;
    use crate::services::reference_client::mock::MockReference;
    use crate::services::storage_client::mock::MockStore;
    use pixq_common::events::EventBus;
    use pixq_common::status::{ProcessingStatus, ReceptionStatus};
    use tempfile::TempDir;

    struct Fixture {
        pool: SqlitePool,
        batch_id: Uuid,
        store: Arc<MockStore>,
        reference: Arc<MockReference>,
        fingerprints: Arc<FingerprintIndex>,
        work: TempDir,
    }

    impl Fixture {
        async fn new(store: MockStore, reference: MockReference) -> Self {
            let pool = SqlitePool::connect(":memory:").await.unwrap();
            pixq_common::db::init::create_batches_table(&pool).await.unwrap();
            pixq_common::db::init::create_items_table(&pool).await.unwrap();
            pixq_common::db::init::create_catalog_entries_table(&pool).await.unwrap();

            let batch = Batch::new("fixture", BatchMeta::default());
            crate::db::batches::insert(&pool, &batch).await.unwrap();

            Self {
                pool,
                batch_id: batch.id,
                store: Arc::new(store),
                reference: Arc::new(reference),
                fingerprints: Arc::new(FingerprintIndex::new()),
                work: TempDir::new().unwrap(),
            }
        }

        fn processor(&self) -> ItemProcessor {
            ItemProcessor::new(
                self.pool.clone(),
                self.store.clone(),
                self.reference.clone(),
                self.fingerprints.clone(),
                Arc::new(ProgressTracker::new(EventBus::new(16), 50)),
                2,
                Duration::from_millis(1),
            )
        }

        /// Register one item whose temp file holds `bytes`
        async fn item(&self, filename: &str, bytes: &[u8], max_retries: u32) -> Item {
            let temp_path = self.work.path().join(format!("{}_{}", Uuid::new_v4().simple(), filename));
            std::fs::write(&temp_path, bytes).unwrap();

            let (sku, sequence) =
                crate::services::archive_extractor::parse_item_key(filename).unwrap();
            let entry = ExtractedEntry {
                sku,
                sequence,
                original_filename: filename.to_string(),
                temp_path,
                size: bytes.len() as u64,
            };
            let item = Item::from_entry(self.batch_id, &entry, max_retries);
            crate::db::items::bulk_insert(&self.pool, &[item.clone()]).await.unwrap();
            crate::db::batches::set_total_items(&self.pool, self.batch_id, 1).await.unwrap();
            item
        }

        async fn reload(&self, id: Uuid) -> Item {
            crate::db::items::get(&self.pool, id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn happy_path_uploads_and_records() {
        let fixture = Fixture::new(
            MockStore::new(),
            MockReference::new().with_entry("ABC-1", "Red chair"),
        )
        .await;
        let processor = fixture.processor();
        let item = fixture.item("ABC-1_front.jpg", b"image bytes", 3).await;

        let outcome = processor.process_one(&item, "worker-0").await;
        assert_eq!(outcome, ProcessOutcome::Completed);

        let loaded = fixture.reload(item.id).await;
        assert_eq!(loaded.processing_status, ProcessingStatus::Completed);
        assert_eq!(loaded.reception_status, ReceptionStatus::Uploaded);
        assert!(loaded.fingerprint.is_some());
        let entry_id = loaded.entry_id.unwrap();

        let entry = crate::db::catalog::get(&fixture.pool, entry_id).await.unwrap().unwrap();
        assert_eq!(entry.sku, "ABC-1");
        assert_eq!(entry.object_name, "ABC-1_front.jpg");
        assert!(entry.matched);
        assert_eq!(entry.title.as_deref(), Some("Red chair"));
        assert_eq!(fixture.store.stored_count(), 1);

        let batch = crate::db::batches::get(&fixture.pool, fixture.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.success_count, 1);
        assert_eq!(batch.processed_items, 1);
    }

    #[tokio::test]
    async fn identical_bytes_become_duplicate_skip() {
        let fixture = Fixture::new(MockStore::new(), MockReference::new()).await;
        let processor = fixture.processor();

        let first = fixture.item("AAA-1.jpg", b"same bytes", 3).await;
        let second = fixture.item("BBB-2.jpg", b"same bytes", 3).await;
        crate::db::batches::set_total_items(&fixture.pool, fixture.batch_id, 2).await.unwrap();

        assert_eq!(
            processor.process_one(&first, "w").await,
            ProcessOutcome::Completed
        );
        assert_eq!(
            processor.process_one(&second, "w").await,
            ProcessOutcome::DuplicateSkip
        );

        // No second storage object
        assert_eq!(fixture.store.stored_count(), 1);

        // The duplicate joins the original's catalog entry and counts as
        // success without an upload
        let loaded = fixture.reload(second.id).await;
        assert_eq!(loaded.processing_status, ProcessingStatus::Completed);
        assert_eq!(loaded.reception_status, ReceptionStatus::Received);
        let first_loaded = fixture.reload(first.id).await;
        assert_eq!(loaded.entry_id, first_loaded.entry_id);

        let batch = crate::db::batches::get(&fixture.pool, fixture.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.success_count, 2);
        assert_eq!(batch.failure_count, 0);
    }

    #[tokio::test]
    async fn missing_temp_file_orphans_item() {
        let fixture = Fixture::new(MockStore::new(), MockReference::new()).await;
        let processor = fixture.processor();
        let item = fixture.item("ABC-1.jpg", b"bytes", 3).await;
        std::fs::remove_file(item.temp_path.as_ref().unwrap()).unwrap();

        let outcome = processor.process_one(&item, "w").await;
        assert_eq!(outcome, ProcessOutcome::Orphaned);

        let loaded = fixture.reload(item.id).await;
        assert_eq!(loaded.processing_status, ProcessingStatus::Orphaned);
        assert!(loaded.last_error.is_some());

        let batch = crate::db::batches::get(&fixture.pool, fixture.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.failure_count, 1);
    }

    #[tokio::test]
    async fn persistent_upload_failure_retries_then_fails() {
        // Every upload attempt refused; processor makes 2 attempts per call
        let fixture = Fixture::new(MockStore::failing_first(usize::MAX), MockReference::new()).await;
        let processor = fixture.processor();
        let item = fixture.item("ABC-1.jpg", b"bytes", 2).await;

        let outcome = processor.process_one(&item, "w").await;
        assert_eq!(outcome, ProcessOutcome::Retried);
        let loaded = fixture.reload(item.id).await;
        assert_eq!(loaded.processing_status, ProcessingStatus::Retry);
        assert_eq!(loaded.retry_count, 1);

        // The reserved fingerprint was released, not left poisoning dedup
        assert!(fixture.fingerprints.is_empty());

        let outcome = processor.process_one(&loaded, "w").await;
        assert_eq!(outcome, ProcessOutcome::Failed);
        let loaded = fixture.reload(item.id).await;
        assert_eq!(loaded.processing_status, ProcessingStatus::Failed);

        let batch = crate::db::batches::get(&fixture.pool, fixture.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.failure_count, 1);
        assert_eq!(batch.success_count, 0);
    }

    #[tokio::test]
    async fn reference_miss_completes_unmatched() {
        let fixture = Fixture::new(MockStore::new(), MockReference::new()).await;
        let processor = fixture.processor();
        let item = fixture.item("ZZZ-9.jpg", b"bytes", 3).await;

        let outcome = processor.process_one(&item, "w").await;
        assert_eq!(outcome, ProcessOutcome::Completed);

        let loaded = fixture.reload(item.id).await;
        let entry = crate::db::catalog::get(&fixture.pool, loaded.entry_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!entry.matched);
        assert!(entry.title.is_none());
    }

    #[tokio::test]
    async fn reference_outage_consumes_a_retry() {
        let fixture = Fixture::new(MockStore::new(), MockReference::new()).await;
        fixture.reference.set_failing(true);
        let processor = fixture.processor();
        let item = fixture.item("ABC-1.jpg", b"bytes", 3).await;

        let outcome = processor.process_one(&item, "w").await;
        assert_eq!(outcome, ProcessOutcome::Retried);

        // Recovers once the reference service is back
        fixture.reference.set_failing(false);
        let loaded = fixture.reload(item.id).await;
        let outcome = processor.process_one(&loaded, "w").await;
        assert_eq!(outcome, ProcessOutcome::Completed);
    }

    #[tokio::test]
    async fn unclaimed_item_is_skipped() {
        let fixture = Fixture::new(MockStore::new(), MockReference::new()).await;
        let processor = fixture.processor();
        let item = fixture.item("ABC-1.jpg", b"bytes", 3).await;

        // Another worker holds the claim
        crate::db::items::claim(&fixture.pool, item.id, "other", 1).await.unwrap();

        let outcome = processor.process_one(&item, "w").await;
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(fixture.store.stored_count(), 0);
    }

    #[test]
    fn object_names_follow_key_sequence_convention() {
        let entry = ExtractedEntry {
            sku: "ABC-1".to_string(),
            sequence: Some("front".to_string()),
            original_filename: "ABC-1_front.JPG".to_string(),
            temp_path: std::path::PathBuf::from("/x"),
            size: 1,
        };
        let item = Item::from_entry(Uuid::new_v4(), &entry, 3);
        assert_eq!(object_name_for(&item), "ABC-1_front.jpg");

        let entry = ExtractedEntry {
            sku: "B-2".to_string(),
            sequence: None,
            original_filename: "B-2.png".to_string(),
            temp_path: std::path::PathBuf::from("/x"),
            size: 1,
        };
        let item = Item::from_entry(Uuid::new_v4(), &entry, 3);
        assert_eq!(object_name_for(&item), "B-2.png");
    }
}
