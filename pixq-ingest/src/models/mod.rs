//! Domain models for the ingest pipeline

pub mod batch;
pub mod item;
pub mod job;
pub mod upload;

pub use batch::{Batch, BatchMeta};
pub use item::Item;
pub use job::{Job, JobKind};
pub use upload::{UploadMeta, UploadSession};
