//! Test helper modules for pixq-ingest integration tests
//!
//! Provides reusable test infrastructure:
//! - TestEnv: database, worker pool, and HTTP router wired to in-memory fakes
//! - FakeStore / FakeReference: controllable stand-ins for the object store
//!   and reference service

// Each integration test binary compiles this module separately and uses
// its own subset of the helpers.
#![allow(dead_code)]

pub mod fakes;
pub mod test_env;

pub use fakes::{FakeReference, FakeStore};
pub use test_env::{build_zip, fast_config, TestEnv};
