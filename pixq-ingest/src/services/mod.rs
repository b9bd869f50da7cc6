//! Service layer
//!
//! Pipeline stages from intake through storage. The orchestrator owns the
//! worker pool; everything below it takes its collaborators as injected
//! trait objects so tests can substitute fakes.

pub mod archive_extractor;
pub mod fingerprint;
pub mod item_processor;
pub mod orchestrator;
pub mod progress;
pub mod reference_client;
pub mod storage_client;
pub mod upload_intake;
pub mod watchdog;
