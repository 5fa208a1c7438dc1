//! Shared types for the btcwatch pipeline.
//!
//! These types form the data model used across all modules: a minute-level
//! price observation and a daily OHLC bar. Both carry a uniqueness invariant
//! enforced by the store: one row per timestamp (minute) or calendar date
//! (daily) in a given table.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single minute-level BTC/USD observation.
///
/// `timestamp` is the bar's open time as a UTC instant. Exactly one row per
/// timestamp may exist in the minute table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub timestamp: DateTime<Utc>,
    pub price_usd: f64,
    /// Volume in quote currency (USD).
    pub volume_usd: f64,
    /// Volume in base currency (BTC).
    pub volume_btc: f64,
}

impl fmt::Display for PriceObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ${:.2} (vol ${:.0} / {:.4} BTC)",
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.price_usd,
            self.volume_usd,
            self.volume_btc,
        )
    }
}

impl PriceObservation {
    /// Unix seconds of the observation timestamp (store key).
    pub fn unix_ts(&self) -> i64 {
        self.timestamp.timestamp()
    }

    /// Helper to build a test observation at a given unix timestamp.
    pub fn sample(ts: i64, price: f64) -> Self {
        use chrono::TimeZone;
        PriceObservation {
            timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
            price_usd: price,
            volume_usd: price * 10.0,
            volume_btc: 10.0,
        }
    }
}

/// A daily BTC/USD OHLC bar. One row per calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open_usd: f64,
    pub high_usd: f64,
    pub low_usd: f64,
    pub close_usd: f64,
    pub volume_usd: f64,
}

impl fmt::Display for DailyBar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} O:{:.2} H:{:.2} L:{:.2} C:{:.2}",
            self.date, self.open_usd, self.high_usd, self.low_usd, self.close_usd,
        )
    }
}

impl DailyBar {
    /// Helper to build a test bar with a flat price.
    pub fn sample(date: NaiveDate, close: f64) -> Self {
        DailyBar {
            date,
            open_usd: close,
            high_usd: close,
            low_usd: close,
            close_usd: close,
            volume_usd: close * 100.0,
        }
    }
}
