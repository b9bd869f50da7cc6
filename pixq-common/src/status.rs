//! Closed status vocabularies for batches and items
//!
//! Stored as TEXT in SQLite (with matching CHECK constraints in the
//! schema) and matched exhaustively in code, so an invalid or misspelled
//! state cannot exist.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one ingestion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created and waiting in the job queue
    Queued,
    /// Bytes still arriving through intake
    Receiving,
    /// Worker is extracting the archive
    Extracting,
    /// Items are being processed
    Processing,
    /// All registered items drained, at least one succeeded
    Completed,
    /// Job error, or items remain unresolved after a pass
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Receiving => "receiving",
            BatchStatus::Extracting => "extracting",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    /// Completed and Failed accept no further orchestrator transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "receiving" => Ok(BatchStatus::Receiving),
            "extracting" => Ok(BatchStatus::Extracting),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown batch status: {}", other))),
        }
    }
}

/// Reception phase of one item: moving raw bytes into durable intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceptionStatus {
    Pending,
    Receiving,
    /// Bytes parked in the extraction work area
    Received,
    /// Bytes persisted in object storage
    Uploaded,
    Failed,
}

impl ReceptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceptionStatus::Pending => "pending",
            ReceptionStatus::Receiving => "receiving",
            ReceptionStatus::Received => "received",
            ReceptionStatus::Uploaded => "uploaded",
            ReceptionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReceptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReceptionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReceptionStatus::Pending),
            "receiving" => Ok(ReceptionStatus::Receiving),
            "received" => Ok(ReceptionStatus::Received),
            "uploaded" => Ok(ReceptionStatus::Uploaded),
            "failed" => Ok(ReceptionStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "Unknown reception status: {}",
                other
            ))),
        }
    }
}

/// Processing phase of one item
///
/// `pending → processing → {completed | retry | failed | orphaned}`;
/// `retry → processing` on re-claim by any worker. `orphaned` is terminal
/// and reserved for items whose source bytes are irrecoverably missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Retry,
    Failed,
    Orphaned,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Retry => "retry",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Orphaned => "orphaned",
        }
    }

    /// Terminal outcomes count toward batch progress exactly once
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::Failed | ProcessingStatus::Orphaned
        )
    }

    /// Resumable items are picked up again by resume or the watchdog
    pub fn is_resumable(&self) -> bool {
        matches!(self, ProcessingStatus::Pending | ProcessingStatus::Retry)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "retry" => Ok(ProcessingStatus::Retry),
            "failed" => Ok(ProcessingStatus::Failed),
            "orphaned" => Ok(ProcessingStatus::Orphaned),
            other => Err(Error::InvalidInput(format!(
                "Unknown processing status: {}",
                other
            ))),
        }
    }
}
