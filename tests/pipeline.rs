//! End-to-end pipeline tests.
//!
//! A deterministic in-memory `PriceSource` plays the role of the remote
//! API, and an in-memory SQLite database the role of the destination
//! store. All state is controllable from test code: history can grow
//! between cycles and any fetch can be forced to fail.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use std::sync::Mutex;

use btcwatch::config::AppConfig;
use btcwatch::features;
use btcwatch::fetch::{FetchError, PriceSource};
use btcwatch::store::SqliteStore;
use btcwatch::sync;
use btcwatch::types::{DailyBar, PriceObservation};

// ---------------------------------------------------------------------------
// Mock source
// ---------------------------------------------------------------------------

/// A scripted market data source. Serves bars from in-memory histories,
/// honouring `limit` and `to_ts` the way the real API does (newest bars
/// not after `to_ts`, at most `limit` of them, ascending).
struct MockPriceSource {
    minute_history: Mutex<Vec<PriceObservation>>,
    daily_history: Mutex<Vec<DailyBar>>,
    force_error: Mutex<Option<String>>,
}

impl MockPriceSource {
    fn new() -> Self {
        Self {
            minute_history: Mutex::new(Vec::new()),
            daily_history: Mutex::new(Vec::new()),
            force_error: Mutex::new(None),
        }
    }

    /// Append `count` minute bars at 60-second spacing starting at `base`.
    fn extend_minutes(&self, base: i64, count: i64) {
        let mut history = self.minute_history.lock().unwrap();
        for i in 0..count {
            let ts = base + i * 60;
            history.push(PriceObservation::sample(ts, 50_000.0 + ts as f64 * 0.01));
        }
    }

    fn push_daily(&self, date: NaiveDate, close: f64) {
        self.daily_history
            .lock()
            .unwrap()
            .push(DailyBar::sample(date, close));
    }

    fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    fn check_error(&self) -> Result<(), FetchError> {
        if let Some(msg) = self.force_error.lock().unwrap().as_ref() {
            return Err(FetchError::Api(msg.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl PriceSource for MockPriceSource {
    async fn fetch_minute_bars(
        &self,
        limit: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<PriceObservation>, FetchError> {
        self.check_error()?;
        let cutoff = to_ts.unwrap_or(i64::MAX);
        let eligible: Vec<PriceObservation> = self
            .minute_history
            .lock()
            .unwrap()
            .iter()
            .filter(|obs| obs.unix_ts() <= cutoff)
            .cloned()
            .collect();
        let start = eligible.len().saturating_sub(limit as usize);
        Ok(eligible[start..].to_vec())
    }

    async fn fetch_daily_bars(
        &self,
        limit: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<DailyBar>, FetchError> {
        self.check_error()?;
        let cutoff = to_ts.unwrap_or(i64::MAX);
        let eligible: Vec<DailyBar> = self
            .daily_history
            .lock()
            .unwrap()
            .iter()
            .filter(|bar| {
                bar.date
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is valid")
                    .and_utc()
                    .timestamp()
                    <= cutoff
            })
            .cloned()
            .collect();
        let start = eligible.len().saturating_sub(limit as usize);
        Ok(eligible[start..].to_vec())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_config(max_rows: i64, realtime_limit: i64) -> AppConfig {
    AppConfig {
        api_key: "test".into(),
        database_url: "sqlite::memory:".into(),
        minute_table: "btc_minute_data".into(),
        daily_table: "btc_daily_data".into(),
        historical_days: 1,
        historical_chunk: 200,
        realtime_limit,
        max_rows,
        poll_interval_secs: 60,
        daily_backfill_days: 10,
        rolling_window: 3,
        forecast_steps: 7,
        event_cutoff: None,
    }
}

async fn memory_store(cfg: &AppConfig) -> SqliteStore {
    let store = SqliteStore::connect(&cfg.database_url).await.unwrap();
    store.ensure_minute_table(&cfg.minute_table).await.unwrap();
    store.ensure_daily_table(&cfg.daily_table).await.unwrap();
    store
}

fn stored_timestamps(rows: &[PriceObservation]) -> Vec<i64> {
    rows.iter().map(PriceObservation::unix_ts).collect()
}

// ---------------------------------------------------------------------------
// Sync-cycle properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_cycle_leaves_rows_unique_by_timestamp() {
    let source = MockPriceSource::new();
    let cfg = test_config(1000, 100);
    let store = memory_store(&cfg).await;

    // Two cycles over heavily overlapping windows.
    source.extend_minutes(1_000_000, 80);
    sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();
    source.extend_minutes(1_000_000 + 80 * 60, 20);
    sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();

    let rows = store.load_observations(&cfg.minute_table, None).await.unwrap();
    let ts = stored_timestamps(&rows);
    let mut deduped = ts.clone();
    deduped.dedup();
    assert_eq!(ts, deduped, "no duplicate timestamps survive a cycle");
    assert_eq!(rows.len(), 100);
}

#[tokio::test]
async fn sync_cycle_twice_with_no_new_data_is_idempotent() {
    let source = MockPriceSource::new();
    let cfg = test_config(1000, 100);
    let store = memory_store(&cfg).await;

    source.extend_minutes(1_000_000, 50);
    sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();
    let before = store.load_observations(&cfg.minute_table, None).await.unwrap();

    let report = sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();
    let after = store.load_observations(&cfg.minute_table, None).await.unwrap();

    assert_eq!(before, after, "second cycle changed nothing");
    assert_eq!(report.appended, 0);
    assert_eq!(report.pruned, 0);
}

#[tokio::test]
async fn row_count_never_exceeds_cap() {
    let source = MockPriceSource::new();
    let cfg = test_config(40, 25);
    let store = memory_store(&cfg).await;

    let mut base = 2_000_000;
    for _ in 0..8 {
        source.extend_minutes(base, 25);
        base += 25 * 60;
        sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();
        let count = store.minute_row_count(&cfg.minute_table).await.unwrap();
        assert!(count <= cfg.max_rows, "cap violated: {count} > {}", cfg.max_rows);
    }
}

#[tokio::test]
async fn prune_evicts_oldest_first() {
    let source = MockPriceSource::new();
    let cfg = test_config(3, 10);
    let store = memory_store(&cfg).await;

    // t1 < t2 < t3 < t4 inserted in order, cap 3.
    for i in 0..4 {
        source.extend_minutes(3_000_000 + i * 60, 1);
        sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();
    }

    let rows = store.load_observations(&cfg.minute_table, None).await.unwrap();
    assert_eq!(
        stored_timestamps(&rows),
        vec![3_000_060, 3_000_120, 3_000_180],
        "only [t2, t3, t4] remain"
    );
}

#[tokio::test]
async fn fetch_failure_skips_cycle_and_leaves_store_intact() {
    let source = MockPriceSource::new();
    let cfg = test_config(1000, 100);
    let store = memory_store(&cfg).await;

    source.extend_minutes(1_000_000, 30);
    sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();
    let before = store.load_observations(&cfg.minute_table, None).await.unwrap();

    source.set_error("simulated rate limit");
    let result = sync::run_minute_cycle(&source, &store, &cfg).await;
    assert!(result.is_err());

    let after = store.load_observations(&cfg.minute_table, None).await.unwrap();
    assert_eq!(before, after, "failed cycle must not mutate the store");

    // And the next cycle recovers.
    source.clear_error();
    assert!(sync::run_minute_cycle(&source, &store, &cfg).await.is_ok());
}

// ---------------------------------------------------------------------------
// Backfill
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ensure_minute_table_backfills_once() {
    let source = MockPriceSource::new();
    let cfg = test_config(10_000, 100);
    let store = memory_store(&cfg).await;

    // 1 day requested at 60s spacing; the mock only has 500 bars, ending now.
    let now = Utc::now().timestamp();
    source.extend_minutes(now - 500 * 60, 500);

    sync::ensure_minute_table(&source, &store, &cfg).await.unwrap();
    let rows = store.load_observations(&cfg.minute_table, None).await.unwrap();
    assert_eq!(rows.len(), 500, "terminated at end-of-history");
    let ts = stored_timestamps(&rows);
    assert!(ts.windows(2).all(|w| w[0] < w[1]), "sorted and deduplicated");

    // Second call must be a no-op.
    sync::ensure_minute_table(&source, &store, &cfg).await.unwrap();
    assert_eq!(store.minute_row_count(&cfg.minute_table).await.unwrap(), 500);
}

#[tokio::test]
async fn ensure_daily_table_backfills_and_daily_cycle_appends_only_new_dates() {
    let source = MockPriceSource::new();
    let cfg = test_config(10_000, 100);
    let store = memory_store(&cfg).await;

    let start = NaiveDate::from_ymd_opt(2025, 4, 20).unwrap();
    for i in 0..10 {
        source.push_daily(start + chrono::Duration::days(i), 95_000.0 + i as f64 * 100.0);
    }

    sync::ensure_daily_table(&source, &store, &cfg).await.unwrap();
    assert_eq!(store.daily_row_count(&cfg.daily_table).await.unwrap(), 10);

    // Same latest bar: nothing appended.
    assert!(!sync::run_daily_cycle(&source, &store, &cfg).await.unwrap());
    assert_eq!(store.daily_row_count(&cfg.daily_table).await.unwrap(), 10);

    // A new calendar day arrives.
    source.push_daily(start + chrono::Duration::days(10), 96_200.0);
    assert!(sync::run_daily_cycle(&source, &store, &cfg).await.unwrap());
    assert_eq!(store.daily_row_count(&cfg.daily_table).await.unwrap(), 11);
}

// ---------------------------------------------------------------------------
// Features over the stored series
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feature_frame_from_stored_series() {
    let source = MockPriceSource::new();
    let mut cfg = test_config(1000, 100);
    cfg.event_cutoff = Some(Utc.timestamp_opt(1_000_000 + 5 * 60, 0).unwrap());
    let store = memory_store(&cfg).await;

    source.extend_minutes(1_000_000, 10);
    sync::run_minute_cycle(&source, &store, &cfg).await.unwrap();

    let rows = store.load_observations(&cfg.minute_table, None).await.unwrap();
    let frame = features::build_features(&rows, cfg.rolling_window, cfg.event_cutoff);
    store.replace_features(&cfg.minute_table, &frame).await.unwrap();

    assert_eq!(frame.len(), 10);
    let flagged: Vec<u8> = frame.iter().map(|f| f.event).collect();
    assert_eq!(flagged, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1]);
    // Rolling mean of the last full window matches a hand computation.
    let tail: f64 = rows[7..10].iter().map(|o| o.price_usd).sum::<f64>() / 3.0;
    assert!((frame[9].rolling_mean - tail).abs() < 1e-9);
}
