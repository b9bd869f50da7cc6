//! Database access layer

pub mod init;

pub use init::*;
