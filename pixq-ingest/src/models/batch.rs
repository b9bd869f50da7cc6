//! Batch model
//!
//! One user-submitted ingestion request. Counters obey
//! `success + failure == processed <= total` at every observation point;
//! they advance only through single-statement increments issued by the
//! progress tracker.

use chrono::{DateTime, Utc};
use pixq_common::status::BatchStatus;
use serde::Serialize;
use uuid::Uuid;

/// Destination and ownership references attached at intake
#[derive(Debug, Clone, Default)]
pub struct BatchMeta {
    pub owner: Option<String>,
    pub collection_id: Option<String>,
    pub brand_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub status: BatchStatus,
    pub total_items: i64,
    pub processed_items: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub owner: Option<String>,
    pub collection_id: Option<String>,
    pub brand_id: Option<String>,
    /// Last job-level error, kept for operator triage
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Create a new batch in Queued status with zeroed counters
    pub fn new(name: impl Into<String>, meta: BatchMeta) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: BatchStatus::Queued,
            total_items: 0,
            processed_items: 0,
            success_count: 0,
            failure_count: 0,
            owner: meta.owner,
            collection_id: meta.collection_id,
            brand_id: meta.brand_id,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Counter consistency rule, checked by tests at observation points
    pub fn counters_consistent(&self) -> bool {
        self.success_count + self.failure_count == self.processed_items
            && self.processed_items <= self.total_items
    }
}
