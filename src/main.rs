//! btcwatch — real-time Bitcoin price ingestion and forecasting daemon.
//!
//! Entry point. Loads configuration from the environment, initialises
//! structured logging, backfills the destination tables on first run, and
//! then runs the fetch/sync/feature/forecast loop on a fixed interval with
//! graceful shutdown.

use anyhow::Result;
use std::time::Duration;
use tracing::{error, info, warn};

use btcwatch::config::AppConfig;
use btcwatch::features;
use btcwatch::fetch::cryptocompare::CryptoCompareClient;
use btcwatch::fetch::PriceSource;
use btcwatch::forecast::{self, SarimaParams};
use btcwatch::store::SqliteStore;
use btcwatch::sync::{self, SyncReport};

/// Below this many daily bars the model is too thin to be worth fitting.
const MIN_FORECAST_HISTORY: usize = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Missing required configuration is fatal, before anything else runs.
    let cfg = AppConfig::from_env()?;

    init_logging();

    info!(
        minute_table = %cfg.minute_table,
        daily_table = %cfg.daily_table,
        poll_interval_secs = cfg.poll_interval_secs,
        max_rows = cfg.max_rows,
        "btcwatch starting up"
    );
    match cfg.event_cutoff {
        Some(cutoff) => info!(%cutoff, "Event flag enabled"),
        None => info!("Event flag disabled (no EVENT_CUTOFF set)"),
    }

    let source = CryptoCompareClient::new(cfg.api_key.clone())?;
    let store = SqliteStore::connect(&cfg.database_url).await?;

    // One-time backfill; both are no-ops when the tables already hold rows.
    sync::ensure_minute_table(&source, &store, &cfg).await?;
    sync::ensure_daily_table(&source, &store, &cfg).await?;

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.poll_interval_secs,
        "Entering sync loop. Press Ctrl+C to stop."
    );

    let mut cycle: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                cycle += 1;
                match run_cycle(&source, &store, &cfg).await {
                    Ok(report) => log_cycle_report(cycle, &report),
                    Err(e) => {
                        // Network and API failures are retryable: log and
                        // wait for the next tick.
                        error!(cycle, error = %e, "Cycle failed, skipping to next");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!(cycles = cycle, "btcwatch shut down cleanly.");
    Ok(())
}

/// Run one fetch → sync → features → forecast cycle.
async fn run_cycle(
    source: &dyn PriceSource,
    store: &SqliteStore,
    cfg: &AppConfig,
) -> Result<SyncReport> {
    let report = sync::run_minute_cycle(source, store, cfg).await?;
    let daily_grew = sync::run_daily_cycle(source, store, cfg).await?;

    // Rebuild the derived feature frame over the current window.
    let observations = store.load_observations(&cfg.minute_table, None).await?;
    let frame = features::build_features(&observations, cfg.rolling_window, cfg.event_cutoff);
    store.replace_features(&cfg.minute_table, &frame).await?;

    // Refit the forecast only when the daily series actually gained a row.
    if daily_grew {
        log_forecast(store, cfg).await;
    }

    Ok(report)
}

/// Fit and log the daily forecast. Failures here are informational only;
/// a thin or degenerate series must not take down the sync loop.
async fn log_forecast(store: &SqliteStore, cfg: &AppConfig) {
    let closes = match store.load_daily_closes(&cfg.daily_table).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Could not load daily closes for forecast");
            return;
        }
    };
    if closes.len() < MIN_FORECAST_HISTORY {
        info!(
            rows = closes.len(),
            needed = MIN_FORECAST_HISTORY,
            "Daily history too short for a forecast yet"
        );
        return;
    }

    match forecast::forecast_daily(&closes, SarimaParams::default(), cfg.forecast_steps, 0.95) {
        Ok(points) => {
            for p in &points {
                info!(
                    date = %p.date,
                    mean = format!("${:.2}", p.mean),
                    lower = format!("${:.2}", p.lower),
                    upper = format!("${:.2}", p.upper),
                    "Forecast"
                );
            }
        }
        Err(e) => warn!(error = %e, "Forecast fit failed"),
    }
}

/// Log a human-readable cycle summary.
fn log_cycle_report(cycle: u64, report: &SyncReport) {
    info!(
        cycle,
        fetched = report.fetched,
        appended = report.appended,
        deduped = report.deduped,
        pruned = report.pruned,
        total_rows = report.total_rows,
        "Cycle complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("btcwatch=info"));

    let json_logging = std::env::var("BTCWATCH_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
