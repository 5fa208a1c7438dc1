//! Derived features over the stored series.
//!
//! Pure transform: no I/O, no side effects. Produces, per observation,
//! a fixed-window rolling mean of the price (used downstream as a
//! confounder proxy) and a binary event flag for rows at or after a
//! configured cutoff instant.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::PriceObservation;

/// One row of the derived feature frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub price_usd: f64,
    /// Rolling mean of the last `window` prices, partial windows averaged
    /// over what is available (min-periods-of-one semantics).
    pub rolling_mean: f64,
    /// 1 for rows at or after the event cutoff, else 0.
    pub event: u8,
}

/// Build the feature frame for an ordered observation slice.
pub fn build_features(
    observations: &[PriceObservation],
    window: usize,
    event_cutoff: Option<DateTime<Utc>>,
) -> Vec<FeatureRow> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(observations.len());
    let mut running_sum = 0.0;

    for (i, obs) in observations.iter().enumerate() {
        running_sum += obs.price_usd;
        if i >= window {
            running_sum -= observations[i - window].price_usd;
        }
        let denom = (i + 1).min(window) as f64;

        let event = match event_cutoff {
            Some(cutoff) if obs.timestamp >= cutoff => 1,
            _ => 0,
        };

        out.push(FeatureRow {
            timestamp: obs.timestamp,
            price_usd: obs.price_usd,
            rolling_mean: running_sum / denom,
            event,
        });
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
