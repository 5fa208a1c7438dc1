//! Price data sources.
//!
//! Defines the `PriceSource` trait and provides the CryptoCompare
//! implementation. The backfill loader and sync loop only ever talk to the
//! trait, so tests can substitute a deterministic in-memory source.

pub mod cryptocompare;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DailyBar, PriceObservation};

/// Errors a fetch can fail with. All variants are retryable: the caller
/// skips the current cycle and tries again on the next tick.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("API error: {0}")]
    Api(String),
}

/// Abstraction over a market data API.
///
/// Implementors return bars ordered ascending by time, with the newest-bar
/// constraint (`to_ts`) applied server-side.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Fetch up to `limit` minute bars, optionally ending at `to_ts`
    /// (unix seconds, inclusive).
    async fn fetch_minute_bars(
        &self,
        limit: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<PriceObservation>, FetchError>;

    /// Fetch up to `limit` daily bars, optionally ending at `to_ts`.
    async fn fetch_daily_bars(
        &self,
        limit: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<DailyBar>, FetchError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}
