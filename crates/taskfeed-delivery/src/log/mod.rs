//! Durable event log
//!
//! This module provides:
//! - [`EventLog`] trait - the append/read contract the rest of the core is built on
//! - [`InMemoryEventLog`] for tests and single-process embedding
//! - [`PostgresEventLog`] for production persistence
//! - [`RetentionPolicy`] - per-partition retention bounds

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;
pub use store::{EventLog, EventLogError, RetentionPolicy};
