//! Assembled test environment
//!
//! Starts the real worker pool against a file-backed SQLite database in a
//! temp root folder. A file-backed database matters here: every worker
//! thread and the test itself must observe the same rows, which an
//! in-memory SQLite pool does not provide.

use pixq_common::config::IngestConfig;
use pixq_common::events::EventBus;
use pixq_ingest::models::{Batch, BatchMeta, Item, Job};
use pixq_ingest::services::fingerprint::FingerprintIndex;
use pixq_ingest::services::orchestrator::{Orchestrator, OrchestratorDeps};
use pixq_ingest::services::progress::ProgressTracker;
use pixq_ingest::services::upload_intake::UploadIntake;
use pixq_ingest::AppState;
use sqlx::SqlitePool;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

use super::fakes::{FakeReference, FakeStore};

/// Pipeline tuning for tests: small pool, fast retries
pub fn fast_config() -> IngestConfig {
    IngestConfig {
        workers: 2,
        queue_capacity: 8,
        item_concurrency: 4,
        max_retries: 2,
        retry_delay_ms: 1,
        ..IngestConfig::default()
    }
}

pub struct TestEnv {
    pub root: TempDir,
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub store: Arc<FakeStore>,
    pub reference: Arc<FakeReference>,
    pub progress: Arc<ProgressTracker>,
    pub intake: Arc<UploadIntake>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestEnv {
    pub async fn start(config: IngestConfig) -> Self {
        Self::start_with(config, FakeStore::new(), FakeReference::new()).await
    }

    pub async fn start_with(
        config: IngestConfig,
        store: FakeStore,
        reference: FakeReference,
    ) -> Self {
        let root = TempDir::new().expect("temp root");
        let db = pixq_common::db::init_database(&root.path().join("pixq.db"))
            .await
            .expect("init database");

        let event_bus = EventBus::new(256);
        let store = Arc::new(store);
        let reference = Arc::new(reference);
        let progress = Arc::new(ProgressTracker::new(event_bus.clone(), 50));
        let intake = Arc::new(UploadIntake::new(root.path(), 3600));

        let orchestrator = Orchestrator::configure(
            config,
            OrchestratorDeps {
                db: db.clone(),
                event_bus: event_bus.clone(),
                store: store.clone(),
                reference: reference.clone(),
                progress: Arc::clone(&progress),
                fingerprints: Arc::new(FingerprintIndex::new()),
                root: root.path().to_path_buf(),
            },
        );
        orchestrator.start();

        Self {
            root,
            db,
            event_bus,
            store,
            reference,
            progress,
            intake,
            orchestrator,
        }
    }

    /// Router over this environment, optionally behind a bearer token
    pub fn router(&self, api_token: Option<&str>) -> axum::Router {
        let state = AppState::new(
            self.db.clone(),
            self.event_bus.clone(),
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.intake),
            Arc::clone(&self.progress),
            api_token.map(String::from),
        );
        pixq_ingest::build_router(state)
    }

    /// Register a batch for a freshly built archive and enqueue its job
    pub async fn submit_archive(&self, name: &str, entries: &[(&str, &[u8])]) -> Uuid {
        let uploads = self.root.path().join("uploads");
        std::fs::create_dir_all(&uploads).expect("uploads dir");
        let archive_path = uploads.join(name);
        build_zip(&archive_path, entries);

        let batch = Batch::new(name.trim_end_matches(".zip"), BatchMeta::default());
        pixq_ingest::db::batches::insert(&self.db, &batch)
            .await
            .expect("insert batch");

        self.orchestrator
            .enqueue(Job::ingest(batch.id, &batch.name, archive_path))
            .expect("enqueue");
        batch.id
    }

    pub async fn batch(&self, batch_id: Uuid) -> Batch {
        pixq_ingest::db::batches::get(&self.db, batch_id)
            .await
            .expect("load batch")
            .expect("batch exists")
    }

    pub async fn items(&self, batch_id: Uuid) -> Vec<Item> {
        pixq_ingest::db::items::list_for_batch(&self.db, batch_id)
            .await
            .expect("load items")
    }

    /// Poll until the batch reaches a terminal status
    pub async fn wait_for_terminal(&self, batch_id: Uuid, timeout: Duration) -> Batch {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let batch = self.batch(batch_id).await;
            if batch.status.is_terminal() {
                return batch;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "batch {} still {:?} after {:?}",
                    batch_id, batch.status, timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn work_dir(&self, batch_id: Uuid) -> PathBuf {
        self.root.path().join("work").join(batch_id.to_string())
    }
}

/// Write a zip archive with the given entries; names ending in `/`
/// become directory entries
pub fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = File::create(path).expect("create zip");
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    for (name, bytes) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(name.trim_end_matches('/'), options)
                .expect("add dir");
        } else {
            writer.start_file(*name, options).expect("start entry");
            writer.write_all(bytes).expect("write entry");
        }
    }
    writer.finish().expect("finish zip");
}
