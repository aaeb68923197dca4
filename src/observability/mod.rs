//! Logging infrastructure.
//!
//! Structured `tracing` events throughout the crate, rendered by a
//! `tracing-subscriber` fmt layer in the binary and in tests.

pub mod tracing;
