//! Chunked upload intake
//!
//! Assembles archives from out-of-order chunks. Sessions live only in
//! memory; `complete` discards the session whether it succeeds or fails
//! terminally, so a client that lost chunks must start a new upload.

use crate::models::upload::{UploadMeta, UploadSession};
use crate::models::{Batch, BatchMeta, Job};
use crate::services::orchestrator::Orchestrator;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("unknown upload: {0}")]
    UnknownUpload(Uuid),

    #[error("{missing} chunks missing")]
    MissingChunks { missing: usize },

    #[error("chunk index {index} out of range (expected 0..{expected})")]
    IndexOutOfRange { index: u32, expected: u32 },

    #[error("invalid upload request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Queue(#[from] crate::services::orchestrator::EnqueueError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Assembled archive, ready to become a batch
#[derive(Debug)]
pub struct AssembledUpload {
    pub archive_path: PathBuf,
    pub filename: String,
}

/// Outcome of finalizing an upload
#[derive(Debug, serde::Serialize)]
pub struct CompletedUpload {
    pub batch_id: Uuid,
    pub queue_position: usize,
}

/// In-memory registry of open upload sessions
pub struct UploadIntake {
    uploads_dir: PathBuf,
    ttl_secs: u64,
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
}

impl UploadIntake {
    pub fn new(root: &Path, ttl_secs: u64) -> Self {
        Self {
            uploads_dir: root.join("uploads"),
            ttl_secs,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session and allocate its chunk directory
    ///
    /// Returns the session id and the number of chunks the client is
    /// expected to submit.
    pub async fn init(
        &self,
        filename: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<(Uuid, u32), IntakeError> {
        if filename.is_empty() {
            return Err(IntakeError::Invalid("filename is empty".to_string()));
        }
        if !filename.to_ascii_lowercase().ends_with(".zip") {
            return Err(IntakeError::Invalid(format!(
                "unsupported archive type: {}",
                filename
            )));
        }
        if total_size == 0 || chunk_size == 0 {
            return Err(IntakeError::Invalid(
                "total size and chunk size must be positive".to_string(),
            ));
        }

        let upload_id = Uuid::new_v4();
        let chunk_dir = self.uploads_dir.join("chunks").join(upload_id.to_string());
        tokio::fs::create_dir_all(&chunk_dir).await?;

        let mut session =
            UploadSession::new(filename.to_string(), total_size, chunk_size, chunk_dir);
        session.upload_id = upload_id;
        let expected_chunks = session.expected_chunks;

        info!(
            upload_id = %upload_id,
            filename = %filename,
            expected_chunks = expected_chunks,
            "Upload session opened"
        );

        self.sessions.write().await.insert(upload_id, session);
        Ok((upload_id, expected_chunks))
    }

    /// Store one chunk; callable concurrently and in any order
    pub async fn put_chunk(
        &self,
        upload_id: Uuid,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), IntakeError> {
        let chunk_path = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&upload_id)
                .ok_or(IntakeError::UnknownUpload(upload_id))?;

            if index >= session.expected_chunks {
                return Err(IntakeError::IndexOutOfRange {
                    index,
                    expected: session.expected_chunks,
                });
            }
            session.chunk_file(index)
        };

        tokio::fs::write(&chunk_path, bytes).await?;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&upload_id)
            .ok_or(IntakeError::UnknownUpload(upload_id))?;
        session.received.insert(index);

        Ok(())
    }

    /// Verify all chunks arrived and concatenate them into one archive
    ///
    /// The session is removed first, so it is gone whether assembly
    /// succeeds or fails with missing chunks.
    pub async fn assemble(&self, upload_id: Uuid) -> Result<AssembledUpload, IntakeError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&upload_id)
            .ok_or(IntakeError::UnknownUpload(upload_id))?;

        let missing = session.missing_count();
        if missing > 0 {
            warn!(upload_id = %upload_id, missing = missing, "Upload incomplete, discarding");
            remove_dir_logged(&session.chunk_dir).await;
            return Err(IntakeError::MissingChunks { missing });
        }

        let archive_path = self
            .uploads_dir
            .join(format!("{}_{}", upload_id.simple(), session.filename));
        let filename = session.filename.clone();

        let assembled_path = archive_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut archive = std::fs::File::create(&assembled_path)?;
            for index in 0..session.expected_chunks {
                let mut chunk = std::fs::File::open(session.chunk_file(index))?;
                std::io::copy(&mut chunk, &mut archive)?;
            }
            std::fs::remove_dir_all(&session.chunk_dir)?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("assembly task failed: {}", e))??;

        info!(upload_id = %upload_id, archive = %archive_path.display(), "Upload assembled");

        Ok(AssembledUpload {
            archive_path,
            filename,
        })
    }

    /// Discard sessions older than the TTL; returns the expired ids
    pub async fn sweep_expired(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let ttl = self.ttl_secs as i64;

        let expired: Vec<(Uuid, PathBuf)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.age_secs(now) > ttl)
                .map(|s| (s.upload_id, s.chunk_dir.clone()))
                .collect()
        };

        if expired.is_empty() {
            return Vec::new();
        }

        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();
        for (upload_id, chunk_dir) in expired {
            if sessions.remove(&upload_id).is_some() {
                warn!(upload_id = %upload_id, "Upload session expired");
                remove_dir_logged(&chunk_dir).await;
                removed.push(upload_id);
            }
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Finalize an upload into a queued batch
///
/// Assembles the archive, creates the batch row in Queued status, and
/// enqueues the job. When the queue is full the batch is finalized Failed
/// and the archive removed, so no row is left dangling in Queued with
/// nothing behind it.
pub async fn complete(
    intake: &UploadIntake,
    db: &SqlitePool,
    orchestrator: &Orchestrator,
    upload_id: Uuid,
    meta: UploadMeta,
) -> Result<CompletedUpload, IntakeError> {
    let assembled = intake.assemble(upload_id).await?;

    let name = meta.name.unwrap_or_else(|| assembled.filename.clone());
    let batch = Batch::new(
        name,
        BatchMeta {
            owner: meta.owner,
            collection_id: meta.collection_id,
            brand_id: meta.brand_id,
        },
    );
    crate::db::batches::insert(db, &batch).await?;

    let job = Job::ingest(batch.id, &batch.name, assembled.archive_path.clone());
    match orchestrator.enqueue(job) {
        Ok(queue_position) => {
            info!(
                batch_id = %batch.id,
                queue_position = queue_position,
                "Batch queued from upload"
            );
            Ok(CompletedUpload {
                batch_id: batch.id,
                queue_position,
            })
        }
        Err(e) => {
            let reason = e.to_string();
            crate::db::batches::finalize(
                db,
                batch.id,
                pixq_common::status::BatchStatus::Failed,
                Some(&reason),
            )
            .await?;
            if let Err(io) = tokio::fs::remove_file(&assembled.archive_path).await {
                warn!(archive = %assembled.archive_path.display(), error = %io, "Failed to remove archive");
            }
            Err(IntakeError::Queue(e))
        }
    }
}

async fn remove_dir_logged(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove chunk directory");
        }
    }
}
