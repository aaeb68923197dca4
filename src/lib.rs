//! Cachet: a durable object cache backed by SQLite.
//!
//! Domain objects are stored as rows, looked up by whichever key types
//! each type declares, and written in atomic batches. Every worker gets
//! its own database session; sessions of workers that go away are
//! reclaimed in the background.
//!
//! # Usage
//!
//! Implement [`Row`] for a type's table representation and [`Entity`]
//! for the type itself, register it with a [`StoreBuilder`], and call
//! the [`Store`] with a [`WorkerToken`] identifying the caller.
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`error`]: Configuration and store errors
//! - [`model`]: Row and entity traits, keys, completeness markers
//! - [`observability`]: Tracing setup
//! - [`registry`]: Per-worker sessions and the background reaper
//! - [`storage`]: SQLite sessions, schema, cache and batch writes
//! - [`store`]: The public store facade

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // store::StoreBuilder is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::needless_raw_string_hashes  // r#""# is fine for SQL
)]

pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod registry;
pub mod storage;
pub mod store;

pub use config::Config;
pub use error::{ConfigError, StoreError};
pub use model::{Column, CompletenessMarker, Entity, Key, KeyKind, Row, RowValues, SqlType};
pub use registry::{SessionRegistry, WorkerId, WorkerToken};
pub use store::{EntityIter, Store, StoreBuilder};
