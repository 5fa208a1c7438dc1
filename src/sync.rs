//! Incremental table synchronization.
//!
//! One sync cycle per wake-up: fetch the realtime window, keep only rows
//! strictly newer than the last stored timestamp, then hand the batch to
//! the store's transactional append → dedupe → prune. The daily table gets
//! the latest bar appended only when its date is strictly newer than the
//! stored maximum.
//!
//! Fetch failures bubble up so the caller can log and skip the cycle; the
//! loop itself never dies on an API error.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::fetch::PriceSource;
use crate::store::SqliteStore;

/// Summary of one minute-table sync cycle, for structured logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    pub fetched: usize,
    pub appended: u64,
    pub deduped: u64,
    pub pruned: u64,
    pub total_rows: i64,
}

/// Run one fetch → filter → append → dedupe → prune cycle against the
/// minute table.
pub async fn run_minute_cycle(
    source: &dyn PriceSource,
    store: &SqliteStore,
    cfg: &AppConfig,
) -> Result<SyncReport> {
    let fetched = source
        .fetch_minute_bars(cfg.realtime_limit, None)
        .await
        .context("Realtime minute fetch failed")?;
    let fetched_count = fetched.len();

    let last_ts = store.last_minute_timestamp(&cfg.minute_table).await?;
    let fresh: Vec<_> = match last_ts {
        Some(last) => fetched
            .into_iter()
            .filter(|obs| obs.unix_ts() > last)
            .collect(),
        None => fetched,
    };
    debug!(
        fetched = fetched_count,
        fresh = fresh.len(),
        ?last_ts,
        "Minute window filtered"
    );

    // Dedupe and prune run even when nothing is fresh, healing any rows a
    // previously interrupted cycle left behind.
    let stats = store
        .sync_observations(&cfg.minute_table, &fresh, cfg.max_rows)
        .await?;

    Ok(SyncReport {
        fetched: fetched_count,
        appended: stats.appended,
        deduped: stats.deduped,
        pruned: stats.pruned,
        total_rows: stats.total_rows,
    })
}

/// Append the most recent daily bar when it is newer than what is stored.
/// Returns true when a new bar was appended.
pub async fn run_daily_cycle(
    source: &dyn PriceSource,
    store: &SqliteStore,
    cfg: &AppConfig,
) -> Result<bool> {
    let bars = source
        .fetch_daily_bars(1, None)
        .await
        .context("Latest daily bar fetch failed")?;
    let Some(latest) = bars.last() else {
        return Ok(false);
    };

    let last_date = store.last_daily_date(&cfg.daily_table).await?;
    let is_new = match last_date {
        Some(stored) => latest.date > stored,
        None => true,
    };

    if is_new {
        store
            .insert_daily_bars(&cfg.daily_table, std::slice::from_ref(latest))
            .await?;
        info!(date = %latest.date, close = latest.close_usd, "Daily bar appended");
    }
    Ok(is_new)
}

/// Create and backfill the minute table when it is empty. Idempotent:
/// a populated table is left untouched.
pub async fn ensure_minute_table(
    source: &dyn PriceSource,
    store: &SqliteStore,
    cfg: &AppConfig,
) -> Result<()> {
    store.ensure_minute_table(&cfg.minute_table).await?;
    if store.minute_row_count(&cfg.minute_table).await? > 0 {
        debug!(table = %cfg.minute_table, "Minute table already populated — skipping backfill");
        return Ok(());
    }

    info!(
        days = cfg.historical_days,
        table = %cfg.minute_table,
        "Backfilling minute history"
    );
    let rows = crate::backfill::backfill_minutes(
        source,
        cfg.historical_minutes(),
        cfg.historical_chunk,
    )
    .await?;
    store.insert_observations(&cfg.minute_table, &rows).await?;
    Ok(())
}

/// Create and backfill the daily table when it is empty.
pub async fn ensure_daily_table(
    source: &dyn PriceSource,
    store: &SqliteStore,
    cfg: &AppConfig,
) -> Result<()> {
    store.ensure_daily_table(&cfg.daily_table).await?;
    if store.daily_row_count(&cfg.daily_table).await? > 0 {
        debug!(table = %cfg.daily_table, "Daily table already populated — skipping backfill");
        return Ok(());
    }

    info!(
        days = cfg.daily_backfill_days,
        table = %cfg.daily_table,
        "Backfilling daily history"
    );
    let bars =
        crate::backfill::backfill_days(source, cfg.daily_backfill_days, cfg.historical_chunk)
            .await?;
    store.insert_daily_bars(&cfg.daily_table, &bars).await?;
    Ok(())
}
