//! SATOSHI TRACER: UTXO provenance tracing with circular-pattern detection.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod chain;
pub mod trace;
pub mod patterns;
pub mod session;
pub mod server;
