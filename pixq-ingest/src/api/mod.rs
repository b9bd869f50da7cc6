//! HTTP API handlers
//!
//! Thin adapters over the service layer; handlers translate HTTP to
//! component calls and carry no pipeline logic of their own.

pub mod auth;
pub mod batches;
pub mod events;
pub mod status;
pub mod uploads;

pub use batches::batch_routes;
pub use events::event_stream;
pub use status::status_routes;
pub use uploads::upload_routes;
