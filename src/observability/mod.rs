//! Observability for the replication engine
//!
//! Structured JSON logging only. Observability is read-only: nothing here
//! has side effects on replication, recovery or cleanup decisions.

pub mod logger;

pub use logger::{Logger, Severity};
