//! Batch progress tracking
//!
//! Concurrent workers report terminal item outcomes here. Each batch has
//! its own async lock, so counter updates and the finalization decision
//! for one batch serialize without stalling other batches.
//!
//! The counter increments themselves are single UPDATE statements; the
//! per-batch lock exists so the read-back snapshot used for progress
//! events and the drained-check during finalization see a stable state.

use anyhow::Result;
use chrono::Utc;
use pixq_common::events::{EventBus, IngestEvent};
use pixq_common::status::BatchStatus;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Default emission cadence: one BatchProgress event per 50 outcomes
pub const PROGRESS_EVENT_INTERVAL: u32 = 50;

pub struct ProgressTracker {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    event_bus: EventBus,
    /// Emit a BatchProgress event every N terminal outcomes
    update_interval: i64,
}

impl ProgressTracker {
    pub fn new(event_bus: EventBus, update_interval: u32) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            event_bus,
            update_interval: update_interval.max(1) as i64,
        }
    }

    fn batch_lock(&self, batch_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(batch_id).or_default().clone()
    }

    /// Record one terminal item outcome against its batch
    pub async fn record_outcome(
        &self,
        db: &SqlitePool,
        batch_id: Uuid,
        success: bool,
    ) -> Result<()> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock().await;

        crate::db::batches::record_outcome(db, batch_id, success).await?;

        let Some(batch) = crate::db::batches::get(db, batch_id).await? else {
            return Ok(());
        };

        if batch.processed_items % self.update_interval == 0
            || batch.processed_items == batch.total_items
        {
            self.event_bus.emit_lossy(IngestEvent::BatchProgress {
                batch_id,
                total: batch.total_items,
                processed: batch.processed_items,
                success: batch.success_count,
                failure: batch.failure_count,
                timestamp: Utc::now(),
            });
        }

        Ok(())
    }

    /// Emit a progress snapshot unconditionally
    ///
    /// The orchestrator calls this at sub-batch boundaries so listeners
    /// see movement even when the cadence suppressed per-item events.
    pub async fn emit_snapshot(&self, db: &SqlitePool, batch_id: Uuid) -> Result<()> {
        let Some(batch) = crate::db::batches::get(db, batch_id).await? else {
            return Ok(());
        };

        self.event_bus.emit_lossy(IngestEvent::BatchProgress {
            batch_id,
            total: batch.total_items,
            processed: batch.processed_items,
            success: batch.success_count,
            failure: batch.failure_count,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Finalize a batch if the current pass drained it
    ///
    /// Completed requires no pending/retry items left and at least one
    /// success; a drained batch with zero successes is Failed. Returns
    /// None when resumable items remain (the batch stays open for a later
    /// pass).
    pub async fn finalize_if_drained(
        &self,
        db: &SqlitePool,
        batch_id: Uuid,
    ) -> Result<Option<BatchStatus>> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock().await;

        let resumable = crate::db::items::count_resumable(db, batch_id).await?;
        if resumable > 0 {
            return Ok(None);
        }

        let Some(batch) = crate::db::batches::get(db, batch_id).await? else {
            return Ok(None);
        };

        let status = if batch.success_count > 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };
        crate::db::batches::finalize(db, batch_id, status, None).await?;

        info!(
            batch_id = %batch_id,
            status = %status,
            success = batch.success_count,
            failure = batch.failure_count,
            "Batch finalized"
        );

        self.event_bus.emit_lossy(IngestEvent::BatchCompleted {
            batch_id,
            status,
            success: batch.success_count,
            failure: batch.failure_count,
            timestamp: Utc::now(),
        });

        // The batch is terminal; drop its lock entry
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&batch_id);

        Ok(Some(status))
    }

    /// Roll counters back for items a force-retry reset to pending
    pub async fn rollback_for_retry(
        &self,
        db: &SqlitePool,
        batch_id: Uuid,
        reset_count: u64,
    ) -> Result<()> {
        if reset_count == 0 {
            return Ok(());
        }
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock().await;

        crate::db::batches::rollback_failures(db, batch_id, reset_count as i64).await?;
        Ok(())
    }
}
