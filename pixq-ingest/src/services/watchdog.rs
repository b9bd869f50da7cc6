//! Stuck-work recovery
//!
//! Two halves. A one-shot reconciliation pass runs at startup, before the
//! worker pool comes up, and repairs whatever an unclean stop left behind:
//! interrupted receptions fail, interrupted processing goes back to retry,
//! and every unfinished batch either finalizes or returns to the queue.
//! A periodic sweep then runs for the life of the process, catching items
//! whose owning worker stopped heartbeating and upload sessions that idled
//! past their TTL.
//!
//! The steady-state sweep only ever uses guarded conditional updates, so a
//! worker that is merely slow, not dead, keeps ownership: its own terminal
//! update and the watchdog's recovery update cannot both win.

use crate::db::{batches, items};
use crate::models::Job;
use crate::services::progress::ProgressTracker;
use crate::services::upload_intake::UploadIntake;
use chrono::Utc;
use pixq_common::config::IngestConfig;
use pixq_common::events::{EventBus, IngestEvent, RecoveryAction};
use pixq_common::status::BatchStatus;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Watchdog {
    db: SqlitePool,
    event_bus: EventBus,
    progress: Arc<ProgressTracker>,
    intake: Arc<UploadIntake>,
    stuck_timeout_secs: i64,
    interval: Duration,
}

impl Watchdog {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        progress: Arc<ProgressTracker>,
        intake: Arc<UploadIntake>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            db,
            event_bus,
            progress,
            intake,
            stuck_timeout_secs: config.stuck_timeout_secs,
            interval: Duration::from_secs(config.watchdog_interval_secs.max(1)),
        }
    }

    /// Reconcile state left by an unclean stop
    ///
    /// Must run before the worker pool starts; the recovery updates here
    /// assume no live worker owns anything. Returns a resume job for every
    /// batch that still has resumable items, for the caller to enqueue.
    pub async fn startup_recovery(&self) -> anyhow::Result<Vec<Job>> {
        let reception_failures = items::recover_interrupted_receiving(&self.db).await?;
        if !reception_failures.is_empty() {
            warn!(
                items = reception_failures.len(),
                "Failed items interrupted during reception"
            );
        }
        for batch_id in &reception_failures {
            self.progress.record_outcome(&self.db, *batch_id, false).await?;
        }

        let requeued = items::recover_interrupted_processing(&self.db).await?;
        if requeued > 0 {
            info!(items = requeued, "Requeued items interrupted mid-processing");
        }

        let mut jobs = Vec::new();
        for batch in batches::list_unfinished(&self.db).await? {
            match self.progress.finalize_if_drained(&self.db, batch.id).await? {
                Some(status) => {
                    info!(batch_id = %batch.id, status = %status, "Finalized interrupted batch");
                }
                None => {
                    batches::set_status(&self.db, batch.id, BatchStatus::Queued).await?;
                    info!(batch_id = %batch.id, name = %batch.name, "Batch resumable after restart");
                    jobs.push(Job::resume(batch.id, &batch.name));
                }
            }
        }

        Ok(jobs)
    }

    /// Periodic sweep loop; returns when the token is cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            stuck_timeout_secs = self.stuck_timeout_secs,
            "Watchdog started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Watchdog stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_stuck_items().await {
                        error!(error = %e, "Stuck-item sweep failed");
                    }
                    self.sweep_upload_sessions().await;
                }
            }
        }
    }

    /// Requeue or fail processing items whose heartbeat went stale
    ///
    /// The list is a snapshot; each recovery re-checks staleness in a
    /// conditional update, so an item whose worker came back alive between
    /// list and update is left alone.
    async fn sweep_stuck_items(&self) -> anyhow::Result<()> {
        let threshold = Utc::now().timestamp() - self.stuck_timeout_secs;
        let stale = items::list_stale_processing(&self.db, threshold).await?;
        if stale.is_empty() {
            return Ok(());
        }

        for item in stale {
            if item.retry_count < item.max_retries {
                if items::requeue_stale(&self.db, item.id, threshold).await? {
                    warn!(
                        item_id = %item.id,
                        batch_id = %item.batch_id,
                        retry_count = item.retry_count + 1,
                        "Requeued stuck item"
                    );
                    self.emit_recovery(item.id, item.batch_id, RecoveryAction::Retry);
                }
            } else if items::fail_stale(&self.db, item.id, threshold).await? {
                warn!(
                    item_id = %item.id,
                    batch_id = %item.batch_id,
                    "Failed stuck item, retries exhausted"
                );
                self.progress.record_outcome(&self.db, item.batch_id, false).await?;
                self.emit_recovery(item.id, item.batch_id, RecoveryAction::Failed);
            }
        }

        Ok(())
    }

    async fn sweep_upload_sessions(&self) {
        for upload_id in self.intake.sweep_expired().await {
            debug!(upload_id = %upload_id, "Expired upload session swept");
            self.event_bus.emit_lossy(IngestEvent::UploadSessionExpired {
                upload_id,
                timestamp: Utc::now(),
            });
        }
    }

    fn emit_recovery(&self, item_id: Uuid, batch_id: Uuid, action: RecoveryAction) {
        self.event_bus.emit_lossy(IngestEvent::ItemRecovered {
            item_id,
            batch_id,
            action,
            timestamp: Utc::now(),
        });
    }
}
