//! Durable store for price observations.
//!
//! SQLite via sqlx. The minute table holds the capped rolling window of
//! `PriceObservation` rows, the daily table the `DailyBar` history, and a
//! derived `<minute_table>_features` table the feature frame.
//!
//! The sync-cycle mutation (append → dedupe → prune) runs inside a single
//! transaction so each cycle is atomic with respect to the store. Dedupe is
//! keyed on the timestamp column itself; `rowid` is only the arbitrary
//! tie-break between identical timestamps.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::types::{DailyBar, PriceObservation};

/// SQLite's bind-parameter limit caps bulk inserts; 3000 rows of 4 columns
/// stays well under it.
const INSERT_CHUNK: usize = 3000;

/// Result of one transactional append → dedupe → prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationStats {
    pub appended: u64,
    pub deduped: u64,
    pub pruned: u64,
    pub total_rows: i64,
}

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connect to the destination database, creating the file if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid DATABASE_URL: {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(60))
            .synchronous(SqliteSynchronous::Normal);

        // Each pooled connection to `:memory:` would get its own private
        // database, so pin in-memory stores to a single held connection.
        let is_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 5 })
            .min_connections(if is_memory { 1 } else { 0 })
            .connect_with(options)
            .await
            .context("Failed to open destination database")?;

        Ok(Self { pool })
    }

    // -- Minute table -----------------------------------------------------

    pub async fn ensure_minute_table(&self, table: &str) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                timestamp  INTEGER NOT NULL,
                price_usd  REAL NOT NULL,
                volume_usd REAL NOT NULL,
                volume_btc REAL NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table}(timestamp)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn minute_row_count(&self, table: &str) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Latest stored timestamp in unix seconds, or None for an empty table.
    pub async fn last_minute_timestamp(&self, table: &str) -> Result<Option<i64>> {
        let row = sqlx::query(&format!("SELECT MAX(timestamp) AS last_ts FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("last_ts")?)
    }

    /// Bulk insert without dedupe or prune, used for the initial backfill
    /// write, where the loader has already deduplicated and sorted.
    pub async fn insert_observations(
        &self,
        table: &str,
        rows: &[PriceObservation],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::new(format!(
                "INSERT INTO {table} (timestamp, price_usd, volume_usd, volume_btc) "
            ));
            qb.push_values(chunk, |mut b, obs| {
                b.push_bind(obs.unix_ts())
                    .push_bind(obs.price_usd)
                    .push_bind(obs.volume_usd)
                    .push_bind(obs.volume_btc);
            });
            qb.build().execute(&self.pool).await?;
        }
        Ok(rows.len() as u64)
    }

    /// The sync-cycle mutation: append the given rows, remove duplicate
    /// timestamps keeping one, and prune the oldest rows beyond `max_rows`,
    /// all in one transaction.
    ///
    /// Safe to call with an empty slice: dedupe and prune still run, which
    /// is what lets a retried cycle self-heal a previous partial append.
    pub async fn sync_observations(
        &self,
        table: &str,
        rows: &[PriceObservation],
        max_rows: i64,
    ) -> Result<MutationStats> {
        let mut tx = self.pool.begin().await?;
        let mut stats = MutationStats::default();

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::new(format!(
                "INSERT INTO {table} (timestamp, price_usd, volume_usd, volume_btc) "
            ));
            qb.push_values(chunk, |mut b, obs| {
                b.push_bind(obs.unix_ts())
                    .push_bind(obs.price_usd)
                    .push_bind(obs.volume_usd)
                    .push_bind(obs.volume_btc);
            });
            stats.appended += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        // Dedupe on the timestamp key; keep the lowest rowid per timestamp.
        let deduped = sqlx::query(&format!(
            "DELETE FROM {table} WHERE rowid NOT IN (
                SELECT MIN(rowid) FROM {table} GROUP BY timestamp
            )"
        ))
        .execute(&mut *tx)
        .await?;
        stats.deduped = deduped.rows_affected();

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;

        if total > max_rows {
            let excess = total - max_rows;
            let pruned = sqlx::query(&format!(
                "DELETE FROM {table} WHERE timestamp IN (
                    SELECT timestamp FROM {table} ORDER BY timestamp ASC LIMIT ?
                )"
            ))
            .bind(excess)
            .execute(&mut *tx)
            .await?;
            stats.pruned = pruned.rows_affected();
        }

        stats.total_rows = total - stats.pruned as i64;
        tx.commit().await?;

        debug!(
            table,
            appended = stats.appended,
            deduped = stats.deduped,
            pruned = stats.pruned,
            total = stats.total_rows,
            "Sync mutation committed"
        );
        Ok(stats)
    }

    /// Load observations ordered ascending, optionally from a start
    /// timestamp (unix seconds, inclusive).
    pub async fn load_observations(
        &self,
        table: &str,
        start_ts: Option<i64>,
    ) -> Result<Vec<PriceObservation>> {
        use chrono::TimeZone;

        let sql = match start_ts {
            Some(_) => format!(
                "SELECT timestamp, price_usd, volume_usd, volume_btc
                 FROM {table} WHERE timestamp >= ? ORDER BY timestamp ASC"
            ),
            None => format!(
                "SELECT timestamp, price_usd, volume_usd, volume_btc
                 FROM {table} ORDER BY timestamp ASC"
            ),
        };
        let mut query = sqlx::query(&sql);
        if let Some(ts) = start_ts {
            query = query.bind(ts);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let unix: i64 = row.try_get("timestamp")?;
                let timestamp = chrono::Utc
                    .timestamp_opt(unix, 0)
                    .single()
                    .context("Stored timestamp out of range")?;
                Ok(PriceObservation {
                    timestamp,
                    price_usd: row.try_get("price_usd")?,
                    volume_usd: row.try_get("volume_usd")?,
                    volume_btc: row.try_get("volume_btc")?,
                })
            })
            .collect()
    }

    // -- Daily table ------------------------------------------------------

    pub async fn ensure_daily_table(&self, table: &str) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                date       TEXT NOT NULL,
                open_usd   REAL NOT NULL,
                high_usd   REAL NOT NULL,
                low_usd    REAL NOT NULL,
                close_usd  REAL NOT NULL,
                volume_usd REAL NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn daily_row_count(&self, table: &str) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Latest stored calendar date, or None for an empty table.
    /// ISO dates sort lexicographically, so MAX on the TEXT column is safe.
    pub async fn last_daily_date(&self, table: &str) -> Result<Option<NaiveDate>> {
        let row = sqlx::query(&format!("SELECT MAX(date) AS last_date FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let raw: Option<String> = row.try_get("last_date")?;
        match raw {
            Some(s) => Ok(Some(
                s.parse::<NaiveDate>()
                    .with_context(|| format!("Stored date is not ISO: {s}"))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn insert_daily_bars(&self, table: &str, bars: &[DailyBar]) -> Result<u64> {
        if bars.is_empty() {
            return Ok(0);
        }
        for chunk in bars.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::new(format!(
                "INSERT INTO {table} (date, open_usd, high_usd, low_usd, close_usd, volume_usd) "
            ));
            qb.push_values(chunk, |mut b, bar| {
                b.push_bind(bar.date.to_string())
                    .push_bind(bar.open_usd)
                    .push_bind(bar.high_usd)
                    .push_bind(bar.low_usd)
                    .push_bind(bar.close_usd)
                    .push_bind(bar.volume_usd);
            });
            qb.build().execute(&self.pool).await?;
        }
        Ok(bars.len() as u64)
    }

    /// Load the daily close series ordered by date.
    pub async fn load_daily_closes(&self, table: &str) -> Result<Vec<(NaiveDate, f64)>> {
        let rows = sqlx::query(&format!(
            "SELECT date, close_usd FROM {table} ORDER BY date ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("date")?;
                let date = raw
                    .parse::<NaiveDate>()
                    .with_context(|| format!("Stored date is not ISO: {raw}"))?;
                Ok((date, row.try_get("close_usd")?))
            })
            .collect()
    }

    // -- Derived features -------------------------------------------------

    /// Replace the derived feature frame for `minute_table`. Full rewrite:
    /// the frame is small (bounded by the minute-table row cap) and derived,
    /// so replace is simpler than diffing.
    pub async fn replace_features(
        &self,
        minute_table: &str,
        rows: &[crate::features::FeatureRow],
    ) -> Result<()> {
        let table = format!("{minute_table}_features");
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                timestamp    INTEGER NOT NULL,
                price_usd    REAL NOT NULL,
                rolling_mean REAL NOT NULL,
                event        INTEGER NOT NULL
            )"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::new(format!(
                "INSERT INTO {table} (timestamp, price_usd, rolling_mean, event) "
            ));
            qb.push_values(chunk, |mut b, f| {
                b.push_bind(f.timestamp.timestamp())
                    .push_bind(f.price_usd)
                    .push_bind(f.rolling_mean)
                    .push_bind(i64::from(f.event));
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
