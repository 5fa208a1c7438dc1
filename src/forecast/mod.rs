//! Daily price forecasting.
//!
//! Wraps a seasonal ARIMA fit over the stored daily close series and
//! produces dated, confidence-bounded predictions. Forecast dates are
//! consecutive calendar days starting the day after the last observed date.

pub mod sarima;

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate};

pub use sarima::{SarimaModel, SarimaParams};

/// One dated forecast row: point estimate plus a two-sided interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Fit a seasonal ARIMA model to the dated close series and forecast
/// `steps` days ahead at the given confidence level.
pub fn forecast_daily(
    closes: &[(NaiveDate, f64)],
    params: SarimaParams,
    steps: usize,
    confidence: f64,
) -> Result<Vec<ForecastPoint>> {
    if steps == 0 {
        return Ok(Vec::new());
    }
    let Some(&(last_date, _)) = closes.last() else {
        bail!("Cannot forecast an empty series");
    };

    let values: Vec<f64> = closes.iter().map(|(_, v)| *v).collect();
    let model = SarimaModel::fit(&values, params)?;
    tracing::debug!(model = %model.summary(), "SARIMA fit");
    let interval = model.forecast_interval(steps, confidence);

    Ok(interval
        .point
        .iter()
        .enumerate()
        .map(|(i, &mean)| ForecastPoint {
            date: last_date + Duration::days(i as i64 + 1),
            mean,
            lower: interval.lower[i],
            upper: interval.upper[i],
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
