//! One-time historical backfill.
//!
//! Walks backward in time: each call requests the maximum per-call chunk
//! ending at `to_ts`, then the next call uses the earliest timestamp of the
//! returned chunk minus one second as its upper bound. An empty chunk means
//! the API has no older history and ends the walk normally.
//!
//! The result is deduplicated by timestamp and sorted ascending, ready for
//! a single bulk write.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::fetch::PriceSource;
use crate::types::{DailyBar, PriceObservation};

/// Pause between chunk requests, to stay friendly with the API rate limit.
const CHUNK_PAUSE: Duration = Duration::from_millis(200);

/// Backfill `total_minutes` of minute bars in chunks of at most `chunk_size`.
pub async fn backfill_minutes(
    source: &dyn PriceSource,
    total_minutes: i64,
    chunk_size: i64,
) -> Result<Vec<PriceObservation>> {
    let mut to_ts = Utc::now().timestamp();
    let mut remaining = total_minutes;
    // BTreeMap keyed by unix seconds gives dedupe + ascending order in one go.
    let mut by_ts: BTreeMap<i64, PriceObservation> = BTreeMap::new();

    while remaining > 0 {
        let batch = chunk_size.min(remaining);
        let chunk = source
            .fetch_minute_bars(batch, Some(to_ts))
            .await
            .context("Minute backfill chunk failed")?;

        if chunk.is_empty() {
            debug!(to_ts, "Empty chunk — end of minute history");
            break;
        }

        let earliest = chunk
            .iter()
            .map(PriceObservation::unix_ts)
            .min()
            .expect("non-empty chunk");
        for obs in chunk {
            by_ts.entry(obs.unix_ts()).or_insert(obs);
        }

        to_ts = earliest - 1;
        remaining -= batch;
        tokio::time::sleep(CHUNK_PAUSE).await;
    }

    let rows: Vec<PriceObservation> = by_ts.into_values().collect();
    info!(rows = rows.len(), total_minutes, "Minute backfill complete");
    Ok(rows)
}

/// Backfill `total_days` of daily bars in chunks of at most `chunk_size`.
pub async fn backfill_days(
    source: &dyn PriceSource,
    total_days: i64,
    chunk_size: i64,
) -> Result<Vec<DailyBar>> {
    let mut to_ts = Utc::now().timestamp();
    let mut remaining = total_days;
    let mut by_date: BTreeMap<chrono::NaiveDate, DailyBar> = BTreeMap::new();

    while remaining > 0 {
        let batch = chunk_size.min(remaining);
        let chunk = source
            .fetch_daily_bars(batch, Some(to_ts))
            .await
            .context("Daily backfill chunk failed")?;

        if chunk.is_empty() {
            debug!(to_ts, "Empty chunk — end of daily history");
            break;
        }

        let earliest = chunk
            .iter()
            .map(|b| b.date)
            .min()
            .expect("non-empty chunk");
        for bar in chunk {
            by_date.entry(bar.date).or_insert(bar);
        }

        to_ts = earliest
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc()
            .timestamp()
            - 1;
        remaining -= batch;
        tokio::time::sleep(CHUNK_PAUSE).await;
    }

    let bars: Vec<DailyBar> = by_date.into_values().collect();
    info!(rows = bars.len(), total_days, "Daily backfill complete");
    Ok(bars)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted source: serves minute bars from a fixed in-memory history,
    /// honouring `limit` and `to_ts` the way the real API does.
    struct ScriptedSource {
        /// Full ascending history, unix seconds → price.
        history: Vec<i64>,
        calls: Mutex<usize>,
    }

    impl ScriptedSource {
        fn with_minutes(count: i64, step: i64) -> Self {
            let base = Utc::now().timestamp() - count * step;
            Self {
                history: (0..count).map(|i| base + i * step).collect(),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        async fn fetch_minute_bars(
            &self,
            limit: i64,
            to_ts: Option<i64>,
        ) -> Result<Vec<PriceObservation>, FetchError> {
            *self.calls.lock().unwrap() += 1;
            let cutoff = to_ts.unwrap_or(i64::MAX);
            let eligible: Vec<i64> = self
                .history
                .iter()
                .copied()
                .filter(|ts| *ts <= cutoff)
                .collect();
            let start = eligible.len().saturating_sub(limit as usize);
            Ok(eligible[start..]
                .iter()
                .map(|ts| PriceObservation::sample(*ts, 100.0))
                .collect())
        }

        async fn fetch_daily_bars(
            &self,
            _limit: i64,
            _to_ts: Option<i64>,
        ) -> Result<Vec<DailyBar>, FetchError> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_backfill_terminates_sorted_deduped() {
        let source = ScriptedSource::with_minutes(500, 60);
        let rows = backfill_minutes(&source, 500, 200).await.unwrap();

        assert_eq!(rows.len(), 500, "full requested span covered");
        assert!(
            rows.windows(2).all(|w| w[0].unix_ts() < w[1].unix_ts()),
            "strictly ascending, so sorted and deduplicated"
        );
        assert!(*source.calls.lock().unwrap() >= 3);
    }

    #[tokio::test]
    async fn test_backfill_stops_on_empty_chunk() {
        // Only 100 bars of history exist but 10_000 are requested.
        let source = ScriptedSource::with_minutes(100, 60);
        let rows = backfill_minutes(&source, 10_000, 60).await.unwrap();
        assert_eq!(rows.len(), 100, "terminates at end-of-history");
    }

    #[tokio::test]
    async fn test_backfill_single_chunk() {
        let source = ScriptedSource::with_minutes(50, 60);
        let rows = backfill_minutes(&source, 50, 2000).await.unwrap();
        assert_eq!(rows.len(), 50);
        assert_eq!(*source.calls.lock().unwrap(), 1);
    }
}
