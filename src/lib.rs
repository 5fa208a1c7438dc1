//! btcwatch — real-time Bitcoin price ingestion and forecasting daemon.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod backfill;
pub mod config;
pub mod features;
pub mod fetch;
pub mod forecast;
pub mod store;
pub mod sync;
pub mod types;
