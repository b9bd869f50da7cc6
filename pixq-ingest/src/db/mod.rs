//! Repository layer over the SQLite schema
//!
//! All item status transitions that can race (worker claim, watchdog
//! recovery) are expressed as conditional UPDATEs so the database is the
//! single arbiter of ownership.

pub mod batches;
pub mod catalog;
pub mod items;
