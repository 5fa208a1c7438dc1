//! Configuration from environment variables.
//!
//! The process environment is the single configuration surface (a `.env`
//! file is loaded by the binary before this runs). Required keys fail fast
//! at startup; everything else carries a default. The resulting config
//! object is constructed once and passed explicitly to each component;
//! there is no module-level global state.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// CryptoCompare API key (required).
    pub api_key: String,
    /// Destination connection string, e.g. `sqlite://btcwatch.db` (required).
    pub database_url: String,
    /// Minute-level table name.
    pub minute_table: String,
    /// Daily-level table name.
    pub daily_table: String,
    /// How many days of minute history to backfill.
    pub historical_days: i64,
    /// Maximum bars per backfill API call.
    pub historical_chunk: i64,
    /// How many minutes the realtime sync window covers.
    pub realtime_limit: i64,
    /// Row cap on the minute table; oldest rows beyond this are pruned.
    pub max_rows: i64,
    /// Seconds between sync cycles.
    pub poll_interval_secs: u64,
    /// How many days of daily history to backfill.
    pub daily_backfill_days: i64,
    /// Rolling-mean window (observations) for the feature builder.
    pub rolling_window: usize,
    /// Forecast horizon in days.
    pub forecast_steps: usize,
    /// Optional market-event cutoff; rows at or after it get event = 1.
    pub event_cutoff: Option<DateTime<Utc>>,
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// Missing required keys are fatal; optional keys fall back to the
    /// defaults the original deployment used.
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("CRYPTOCOMPARE_API_KEY").context("CRYPTOCOMPARE_API_KEY missing")?;
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL missing")?;

        let minute_table = env_or("BTC_MINUTE_TABLE", "btc_minute_data");
        let daily_table = env_or("BTC_DAILY_TABLE", "btc_daily_data");
        validate_table_name(&minute_table)?;
        validate_table_name(&daily_table)?;

        let event_cutoff = match std::env::var("EVENT_CUTOFF") {
            Ok(raw) => Some(
                raw.parse::<DateTime<Utc>>()
                    .with_context(|| format!("EVENT_CUTOFF is not RFC 3339: {raw}"))?,
            ),
            Err(_) => None,
        };

        Ok(AppConfig {
            api_key,
            database_url,
            minute_table,
            daily_table,
            historical_days: parse_or("BTC_HISTORICAL_DAYS", 2)?,
            historical_chunk: parse_or("BTC_HISTORICAL_CHUNK", 2000)?,
            realtime_limit: parse_or("BTC_REALTIME_LIMIT", 24 * 60)?,
            max_rows: parse_or("BTC_MAX_ROWS", 2000)?,
            poll_interval_secs: parse_or("POLL_INTERVAL_SECS", 60)?,
            daily_backfill_days: parse_or("BTC_DAILY_BACKFILL_DAYS", 365)?,
            rolling_window: parse_or("ROLLING_WINDOW", 3)?,
            forecast_steps: parse_or("FORECAST_STEPS", 7)?,
            event_cutoff,
        })
    }

    /// Total minutes of history the backfill should cover.
    pub fn historical_minutes(&self) -> i64 {
        self.historical_days * 24 * 60
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} is not a valid number: {raw}")),
        Err(_) => Ok(default),
    }
}

/// Table names are interpolated into SQL, so restrict them to identifier
/// characters.
fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("Invalid table name: {name:?}");
    }
    Ok(())
}
