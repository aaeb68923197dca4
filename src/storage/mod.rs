//! SQLite storage layer for Cachet.
//!
//! Provides:
//! - Schema generation and schema-mode handling
//! - Pooled session factory
//! - Sessions with a persistence context and write transactions
//! - Shared row cache for unique lookups
//! - Transactional batch writes with flush-and-clear

pub mod batch;
pub mod cache;
pub mod pool;
pub mod schema;
pub mod session;
