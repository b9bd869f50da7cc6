//! pixq-ingest - Batch Image Ingest Service
//!
//! **Module Identity:**
//! - Name: pixq-ingest (Batch Image Ingest)
//! - Port: 5870
//!
//! Accepts chunked archive uploads over HTTP, extracts them, and pushes
//! the contained images through validation, deduplication, reference
//! enrichment and object storage on a bounded worker pool. Progress is
//! broadcast to clients via SSE.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixq_common::config::{self, DedupScope};
use pixq_common::events::EventBus;

use pixq_ingest::services::fingerprint::FingerprintIndex;
use pixq_ingest::services::orchestrator::{Orchestrator, OrchestratorDeps};
use pixq_ingest::services::progress::{ProgressTracker, PROGRESS_EVENT_INTERVAL};
use pixq_ingest::services::reference_client::HttpReferenceClient;
use pixq_ingest::services::storage_client::HttpObjectStore;
use pixq_ingest::services::upload_intake::UploadIntake;
use pixq_ingest::services::watchdog::Watchdog;
use pixq_ingest::AppState;

/// Command-line arguments for pixq-ingest
#[derive(Parser, Debug)]
#[command(name = "pixq-ingest")]
#[command(about = "Batch image ingest microservice for PixQ")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "PIXQ_INGEST_PORT")]
    port: Option<u16>,

    /// Root folder for the database, uploads and work areas
    #[arg(short, long)]
    root_folder: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Resolve root folder (CLI > PIXQ_ROOT_FOLDER > config file > default)
    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), "PIXQ_ROOT_FOLDER")
        .context("Failed to resolve root folder")?;
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;

    let config = config::load_toml_config(&root_folder).context("Failed to load configuration")?;

    // Initialize tracing; RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port = args.port.unwrap_or(config.server.port);

    info!("Starting pixq-ingest (Batch Image Ingest) microservice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Root folder: {}", root_folder.display());

    // Open or create database
    let db_path = root_folder.join("pixq.db");
    info!("Database: {}", db_path.display());
    let db = pixq_common::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database connection established");

    // Event bus for SSE broadcasting
    let event_bus = EventBus::new(100); // 100 event capacity

    let progress = Arc::new(ProgressTracker::new(event_bus.clone(), PROGRESS_EVENT_INTERVAL));
    let intake = Arc::new(UploadIntake::new(
        &root_folder,
        config.ingest.upload_session_ttl_secs as u64,
    ));

    let store = Arc::new(HttpObjectStore::new(
        config.storage.base_url.clone(),
        config.storage.bucket.clone(),
    ));
    let reference = Arc::new(HttpReferenceClient::new(config.reference.base_url.clone()));

    let fingerprints = Arc::new(FingerprintIndex::new());
    if config.ingest.dedup_scope == DedupScope::Process {
        fingerprints
            .warm(&db)
            .await
            .context("Failed to warm fingerprint index")?;
    }

    let orchestrator = Orchestrator::configure(
        config.ingest.clone(),
        OrchestratorDeps {
            db: db.clone(),
            event_bus: event_bus.clone(),
            store,
            reference,
            progress: Arc::clone(&progress),
            fingerprints,
            root: root_folder.clone(),
        },
    );

    let watchdog = Arc::new(Watchdog::new(
        db.clone(),
        event_bus.clone(),
        Arc::clone(&progress),
        Arc::clone(&intake),
        &config.ingest,
    ));

    // Reconcile interrupted work before any worker can claim items
    let resume_jobs = watchdog
        .startup_recovery()
        .await
        .context("Startup recovery failed")?;

    orchestrator.start();

    for job in resume_jobs {
        let batch_id = job.batch_id;
        if let Err(e) = orchestrator.enqueue(job) {
            warn!(batch_id = %batch_id, "Could not requeue interrupted batch: {}", e);
        }
    }

    // Background sweeps for stuck items and expired upload sessions
    let cancel = CancellationToken::new();
    let watchdog_task = tokio::spawn({
        let watchdog = Arc::clone(&watchdog);
        let cancel = cancel.clone();
        async move { watchdog.run(cancel).await }
    });

    let state = AppState::new(
        db,
        event_bus,
        Arc::clone(&orchestrator),
        intake,
        progress,
        config.server.api_token.clone(),
    );

    let app = pixq_ingest::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop the sweeper, then drain the worker pool
    cancel.cancel();
    let _ = watchdog_task.await;
    orchestrator.shutdown();

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
