//! Job queue and worker pool
//!
//! One process-wide coordinator, constructed explicitly through
//! `configure` and brought up with `start`. Owns a bounded FIFO queue of
//! jobs and a fixed pool of OS worker threads; item processing does
//! blocking network I/O and hashing, which want true parallelism rather
//! than a single event loop.
//!
//! Worker threads dequeue with a poll timeout so they observe the
//! shutdown flag, run one job to completion, and return to the loop. Any
//! error or panic escaping a job is caught at the job boundary and marks
//! that batch Failed; it never takes the worker thread down.

use crate::models::{Item, Job, JobKind};
use crate::services::fingerprint::FingerprintIndex;
use crate::services::item_processor::{ItemProcessor, ProcessOutcome};
use crate::services::progress::ProgressTracker;
use crate::services::reference_client::ReferenceLookup;
use crate::services::storage_client::ObjectStore;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use pixq_common::config::{DedupScope, IngestConfig};
use pixq_common::events::{EventBus, IngestEvent};
use pixq_common::status::BatchStatus;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a blocked dequeue waits before re-checking the stop flag
const DEQUEUE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("job queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

/// Aggregate queue statistics snapshot
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub queue_depth: usize,
    pub total_queued: u64,
    /// Jobs that ran to completion
    pub total_processed: u64,
    /// Jobs that failed at the job boundary
    pub total_errors: u64,
    pub active_workers: usize,
}

/// Collaborators injected at configure time
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub store: Arc<dyn ObjectStore>,
    pub reference: Arc<dyn ReferenceLookup>,
    pub progress: Arc<ProgressTracker>,
    /// Shared fingerprint index for process-wide dedup scope
    pub fingerprints: Arc<FingerprintIndex>,
    /// Root folder holding uploads/ and work/
    pub root: PathBuf,
}

struct SharedQueueState {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    stop_flag: AtomicBool,
}

#[derive(Default)]
struct Counters {
    total_queued: AtomicU64,
    total_processed: AtomicU64,
    total_errors: AtomicU64,
    active_workers: AtomicUsize,
}

pub struct Orchestrator {
    state: Arc<SharedQueueState>,
    counters: Arc<Counters>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    config: IngestConfig,
    deps: OrchestratorDeps,
}

impl Orchestrator {
    /// Build the coordinator without starting workers
    ///
    /// Tests construct a fresh instance per case; production constructs
    /// exactly one at startup.
    pub fn configure(config: IngestConfig, deps: OrchestratorDeps) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(SharedQueueState {
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                stop_flag: AtomicBool::new(false),
            }),
            counters: Arc::new(Counters::default()),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            config,
            deps,
        })
    }

    /// Spawn the worker pool
    ///
    /// Must be called from within the async runtime: workers capture the
    /// runtime handle so they can drive async item processing from their
    /// OS threads.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already started");
            return;
        }

        let rt_handle = tokio::runtime::Handle::current();
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());

        for worker_id in 0..self.config.workers {
            let state = Arc::clone(&self.state);
            let counters = Arc::clone(&self.counters);
            let config = self.config.clone();
            let deps = self.deps.clone();
            let handle = rt_handle.clone();

            let thread = thread::spawn(move || {
                worker_loop(worker_id, state, counters, config, deps, handle);
            });

            threads.push(thread);
        }

        info!(workers = self.config.workers, "Worker pool started");
    }

    /// Append a job; returns its 1-based queue position
    pub fn enqueue(&self, job: Job) -> Result<usize, EnqueueError> {
        enqueue_inner(
            &self.state,
            &self.counters,
            &self.deps.event_bus,
            self.config.queue_capacity,
            job,
        )
    }

    pub fn stats(&self) -> QueueStats {
        let queue_depth = self
            .state
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();

        QueueStats {
            queue_depth,
            total_queued: self.counters.total_queued.load(Ordering::Relaxed),
            total_processed: self.counters.total_processed.load(Ordering::Relaxed),
            total_errors: self.counters.total_errors.load(Ordering::Relaxed),
            active_workers: self.counters.active_workers.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs and join the workers
    ///
    /// Workers finish their current job first; queued jobs are left for
    /// the next startup's recovery pass to requeue.
    pub fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.state.stop_flag.store(true, Ordering::SeqCst);
        self.state.condvar.notify_all();

        let threads: Vec<JoinHandle<()>> = {
            let mut guard = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };

        for (idx, handle) in threads.into_iter().enumerate() {
            if let Err(e) = handle.join() {
                error!(worker = idx, "Worker join failed: {:?}", e);
            }
        }

        info!("Orchestrator shut down");
    }
}

fn enqueue_inner(
    state: &SharedQueueState,
    counters: &Counters,
    event_bus: &EventBus,
    capacity: usize,
    job: Job,
) -> Result<usize, EnqueueError> {
    if state.stop_flag.load(Ordering::SeqCst) {
        return Err(EnqueueError::ShuttingDown);
    }

    let position = {
        let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= capacity {
            return Err(EnqueueError::QueueFull { capacity });
        }
        queue.push_back(job.clone());
        queue.len()
    };

    counters.total_queued.fetch_add(1, Ordering::Relaxed);
    state.condvar.notify_one();

    debug!(batch_id = %job.batch_id, position = position, "Job enqueued");
    event_bus.emit_lossy(IngestEvent::BatchQueued {
        batch_id: job.batch_id,
        name: job.batch_name.clone(),
        queue_position: position,
        timestamp: Utc::now(),
    });

    Ok(position)
}

fn worker_loop(
    worker_id: usize,
    state: Arc<SharedQueueState>,
    counters: Arc<Counters>,
    config: IngestConfig,
    deps: OrchestratorDeps,
    rt_handle: tokio::runtime::Handle,
) {
    debug!(worker = worker_id, "Worker started");
    let worker_name = format!("worker-{}", worker_id);

    loop {
        let job = {
            let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if state.stop_flag.load(Ordering::SeqCst) {
                    debug!(worker = worker_id, "Worker received shutdown signal");
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                let (guard, _) = state
                    .condvar
                    .wait_timeout(queue, DEQUEUE_POLL)
                    .unwrap_or_else(|e| e.into_inner());
                queue = guard;
            }
        };

        counters.active_workers.fetch_add(1, Ordering::SeqCst);
        info!(worker = worker_id, batch_id = %job.batch_id, "Job started");

        // Run the job, then cleanup, whatever happened. A panic inside the
        // job is caught here like any other failure so the worker survives.
        let outcome = rt_handle.block_on(async {
            let result =
                AssertUnwindSafe(execute_job(&job, &config, &deps, &state, &counters, &worker_name))
                    .catch_unwind()
                    .await;
            cleanup_job(&job, &deps.root).await;
            result
        });

        counters.active_workers.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => {
                counters.total_processed.fetch_add(1, Ordering::Relaxed);
                info!(worker = worker_id, batch_id = %job.batch_id, "Job finished");
            }
            Ok(Err(e)) => {
                counters.total_errors.fetch_add(1, Ordering::Relaxed);
                error!(worker = worker_id, batch_id = %job.batch_id, error = %e, "Job failed");
                rt_handle.block_on(fail_batch(&deps, job.batch_id, &e.to_string()));
            }
            Err(_panic) => {
                counters.total_errors.fetch_add(1, Ordering::Relaxed);
                error!(worker = worker_id, batch_id = %job.batch_id, "Job panicked");
                rt_handle.block_on(fail_batch(&deps, job.batch_id, "job panicked"));
            }
        }
    }
}

async fn execute_job(
    job: &Job,
    config: &IngestConfig,
    deps: &OrchestratorDeps,
    state: &Arc<SharedQueueState>,
    counters: &Arc<Counters>,
    worker_name: &str,
) -> anyhow::Result<()> {
    if let JobKind::Ingest { archive_path } = &job.kind {
        set_status(deps, job.batch_id, BatchStatus::Extracting).await?;

        let work_dir = job.work_dir(&deps.root);
        // Blocking extraction is fine here: this future runs on the
        // worker's own OS thread, not a shared runtime thread
        let outcome = crate::services::archive_extractor::extract_archive(archive_path, &work_dir)?;

        if outcome.entries.is_empty() {
            anyhow::bail!(
                "archive contained no processable entries ({} skipped)",
                outcome.skipped.total()
            );
        }

        let items: Vec<Item> = outcome
            .entries
            .iter()
            .map(|entry| Item::from_entry(job.batch_id, entry, config.max_retries))
            .collect();
        crate::db::items::bulk_insert(&deps.db, &items).await?;
        crate::db::batches::set_total_items(&deps.db, job.batch_id, items.len() as i64).await?;

        info!(
            batch_id = %job.batch_id,
            registered = items.len(),
            skipped = outcome.skipped.total(),
            "Items registered"
        );
    }

    crate::db::batches::mark_processing(&deps.db, job.batch_id).await?;
    deps.event_bus.emit_lossy(IngestEvent::BatchStatusChanged {
        batch_id: job.batch_id,
        status: BatchStatus::Processing,
        timestamp: Utc::now(),
    });

    let processor = build_processor(config, deps);

    // Drain to terminal: failing items come back as retry and are re-picked
    // until their budget runs out, so the loop is bounded by max_retries
    loop {
        let resumable = crate::db::items::load_resumable(&deps.db, job.batch_id).await?;
        if resumable.is_empty() {
            break;
        }

        for sub_batch in resumable.chunks(config.item_concurrency.max(1)) {
            let results = join_all(
                sub_batch
                    .iter()
                    .map(|item| processor.process_one(item, worker_name)),
            )
            .await;

            let terminal_failures = results.iter().filter(|o| o.is_terminal_failure()).count();
            if terminal_failures > 0 {
                debug!(
                    batch_id = %job.batch_id,
                    failures = terminal_failures,
                    "Sub-batch finished with terminal failures"
                );
            }

            deps.progress.emit_snapshot(&deps.db, job.batch_id).await?;

            if results.iter().all(|o| *o == ProcessOutcome::Skipped) {
                // Every claim lost: another actor owns these items; let it
                warn!(batch_id = %job.batch_id, "Sub-batch fully skipped, yielding batch");
                return finish_pass(job, config, deps, state, counters).await;
            }
        }
    }

    finish_pass(job, config, deps, state, counters).await
}

/// Finalize the batch, or hand it back to the queue if items remain
async fn finish_pass(
    job: &Job,
    config: &IngestConfig,
    deps: &OrchestratorDeps,
    state: &Arc<SharedQueueState>,
    counters: &Arc<Counters>,
) -> anyhow::Result<()> {
    match deps.progress.finalize_if_drained(&deps.db, job.batch_id).await? {
        Some(_status) => Ok(()),
        None => {
            // Resumable items remain (recovered mid-pass by the watchdog).
            // Requeue so they get their remaining attempts.
            crate::db::batches::set_status(&deps.db, job.batch_id, BatchStatus::Queued).await?;
            deps.event_bus.emit_lossy(IngestEvent::BatchStatusChanged {
                batch_id: job.batch_id,
                status: BatchStatus::Queued,
                timestamp: Utc::now(),
            });

            let resume = Job::resume(job.batch_id, &job.batch_name);
            if let Err(e) = enqueue_inner(
                state,
                counters,
                &deps.event_bus,
                config.queue_capacity,
                resume,
            ) {
                warn!(batch_id = %job.batch_id, error = %e, "Could not requeue batch; left Queued for operator resume");
            }
            Ok(())
        }
    }
}

fn build_processor(config: &IngestConfig, deps: &OrchestratorDeps) -> ItemProcessor {
    let fingerprints = match config.dedup_scope {
        DedupScope::Process => Arc::clone(&deps.fingerprints),
        DedupScope::Batch => Arc::new(FingerprintIndex::new()),
    };

    ItemProcessor::new(
        deps.db.clone(),
        Arc::clone(&deps.store),
        Arc::clone(&deps.reference),
        fingerprints,
        Arc::clone(&deps.progress),
        config.max_retries,
        Duration::from_millis(config.retry_delay_ms),
    )
}

async fn set_status(
    deps: &OrchestratorDeps,
    batch_id: Uuid,
    status: BatchStatus,
) -> anyhow::Result<()> {
    crate::db::batches::set_status(&deps.db, batch_id, status).await?;
    deps.event_bus.emit_lossy(IngestEvent::BatchStatusChanged {
        batch_id,
        status,
        timestamp: Utc::now(),
    });
    Ok(())
}

async fn fail_batch(deps: &OrchestratorDeps, batch_id: Uuid, error: &str) {
    if let Err(e) =
        crate::db::batches::finalize(&deps.db, batch_id, BatchStatus::Failed, Some(error)).await
    {
        error!(batch_id = %batch_id, error = %e, "Failed to mark batch failed");
        return;
    }
    deps.event_bus.emit_lossy(IngestEvent::BatchStatusChanged {
        batch_id,
        status: BatchStatus::Failed,
        timestamp: Utc::now(),
    });
}

/// Remove the archive and the extraction work area
///
/// Runs after every job, success or failure. Items that still need their
/// temp files after this point (crash recovery) only exist when this
/// cleanup never ran, which is what makes resume-after-crash work.
async fn cleanup_job(job: &Job, root: &std::path::Path) {
    if let Some(archive) = job.archive_path() {
        if let Err(e) = tokio::fs::remove_file(archive).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(archive = %archive.display(), error = %e, "Failed to remove archive");
            }
        }
    }

    let work_dir = job.work_dir(root);
    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(work_dir = %work_dir.display(), error = %e, "Failed to remove work directory");
        }
    }
}
