//! # PixQ Common Library
//!
//! Shared code for the PixQ ingest service:
//! - Infrastructure error type
//! - Configuration loading and root folder resolution
//! - Database initialization and schema
//! - Closed batch/item status vocabularies
//! - Event types (IngestEvent enum) and EventBus

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod status;

pub use error::{Error, Result};
