//! Queue job model
//!
//! Jobs are ephemeral: they exist only inside the orchestrator's queue and
//! are discarded after processing. Everything durable lives on the batch
//! and item rows, which is what makes crash recovery possible.

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What the worker should do with the batch
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Fresh archive: extract, register items, process everything
    Ingest { archive_path: PathBuf },
    /// Re-process already registered items in pending/retry status
    Resume,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub batch_id: Uuid,
    pub batch_name: String,
    pub kind: JobKind,
}

impl Job {
    pub fn ingest(batch_id: Uuid, batch_name: impl Into<String>, archive_path: PathBuf) -> Self {
        Self {
            batch_id,
            batch_name: batch_name.into(),
            kind: JobKind::Ingest { archive_path },
        }
    }

    pub fn resume(batch_id: Uuid, batch_name: impl Into<String>) -> Self {
        Self {
            batch_id,
            batch_name: batch_name.into(),
            kind: JobKind::Resume,
        }
    }

    /// Extraction work area for this batch
    ///
    /// Derived deterministically from the batch id, never stored, so a
    /// resumed job after a crash finds the same directory.
    pub fn work_dir(&self, root: &Path) -> PathBuf {
        root.join("work").join(self.batch_id.to_string())
    }

    /// Archive file to remove during cleanup, if this job carries one
    pub fn archive_path(&self) -> Option<&Path> {
        match &self.kind {
            JobKind::Ingest { archive_path } => Some(archive_path),
            JobKind::Resume => None,
        }
    }
}
