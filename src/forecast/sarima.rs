//! Seasonal ARIMA model.
//!
//! Conditional least-squares estimation: the series is seasonally
//! differenced D times at lag s, regularly differenced d times, and an
//! ARMA with both regular and seasonal lags is fit by OLS (Hannan–Rissanen
//! two-step when MA terms are present). Forecasts are produced by the
//! usual recursion with future residuals at their zero expectation, then
//! the differencing is inverted to return to the original scale.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

/// Model orders: regular `(p, d, q)` and seasonal `(P, D, Q, s)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SarimaParams {
    pub order: (usize, usize, usize),
    pub seasonal_order: (usize, usize, usize, usize),
}

impl SarimaParams {
    pub fn new(order: (usize, usize, usize), seasonal_order: (usize, usize, usize, usize)) -> Self {
        Self {
            order,
            seasonal_order,
        }
    }

    /// AR lag set: regular lags 1..=p plus seasonal lags s, 2s, …, P·s.
    fn ar_lags(&self) -> Vec<usize> {
        let (p, _, _) = self.order;
        let (sp, _, _, s) = self.seasonal_order;
        merge_lags(p, sp, s)
    }

    /// MA lag set: regular lags 1..=q plus seasonal lags s, 2s, …, Q·s.
    fn ma_lags(&self) -> Vec<usize> {
        let (_, _, q) = self.order;
        let (_, _, sq, s) = self.seasonal_order;
        merge_lags(q, sq, s)
    }
}

impl Default for SarimaParams {
    fn default() -> Self {
        // The deployment default: ARIMA(1,1,1) without a seasonal component.
        Self::new((1, 1, 1), (0, 0, 0, 0))
    }
}

fn merge_lags(regular: usize, seasonal: usize, s: usize) -> Vec<usize> {
    let mut lags: Vec<usize> = (1..=regular).collect();
    if s > 0 {
        for k in 1..=seasonal {
            let lag = k * s;
            if !lags.contains(&lag) {
                lags.push(lag);
            }
        }
    }
    lags.sort_unstable();
    lags
}

/// Forecast with a two-sided confidence interval, index-aligned by horizon.
#[derive(Debug, Clone)]
pub struct ForecastInterval {
    pub point: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub confidence: f64,
}

/// A fitted seasonal ARIMA model.
#[derive(Debug, Clone)]
pub struct SarimaModel {
    pub params: SarimaParams,
    /// AR coefficients paired with their lags.
    pub ar: Vec<(usize, f64)>,
    /// MA coefficients paired with their lags.
    pub ma: Vec<(usize, f64)>,
    pub constant: f64,
    pub sigma2: f64,
    pub aic: f64,
    /// Fully differenced training series the ARMA was estimated on.
    train: Vec<f64>,
    /// Residuals aligned with `train` (zero before the estimation window).
    residuals: Vec<f64>,
    /// Last value of the series before each regular difference, in
    /// application order.
    regular_tails: Vec<f64>,
    /// Last s values of the series before each seasonal difference, in
    /// application order.
    seasonal_tails: Vec<Vec<f64>>,
}

impl SarimaModel {
    /// Fit the model to `data` by conditional least squares.
    pub fn fit(data: &[f64], params: SarimaParams) -> Result<Self> {
        let (_, d, _) = params.order;
        let (sp, sd, sq, s) = params.seasonal_order;
        if (sp > 0 || sd > 0 || sq > 0) && s < 2 {
            bail!("Seasonal orders require a seasonal period of at least 2");
        }

        // Seasonal differencing first, then regular.
        let mut work = data.to_vec();
        let mut seasonal_tails = Vec::with_capacity(sd);
        for _ in 0..sd {
            if work.len() <= s {
                bail!(
                    "Not enough observations to difference at seasonal lag {s} ({} available)",
                    work.len()
                );
            }
            seasonal_tails.push(work[work.len() - s..].to_vec());
            work = seasonal_difference(&work, s);
        }

        let mut regular_tails = Vec::with_capacity(d);
        for _ in 0..d {
            if work.len() < 2 {
                bail!("Not enough observations to difference");
            }
            regular_tails.push(*work.last().expect("checked non-empty"));
            work = difference(&work);
        }

        let ar_lags = params.ar_lags();
        let ma_lags = params.ma_lags();
        let (ar, ma, constant, residuals) = estimate(&work, &ar_lags, &ma_lags)?;

        let n_eff = residuals.len().max(1) as f64;
        let sigma2 = residuals.iter().map(|r| r * r).sum::<f64>() / n_eff;
        let k = (ar.len() + ma.len() + 1) as f64;
        let log_likelihood =
            -0.5 * n_eff * (1.0 + (2.0 * std::f64::consts::PI * sigma2.max(1e-12)).ln());
        let aic = -2.0 * log_likelihood + 2.0 * k;

        Ok(Self {
            params,
            ar,
            ma,
            constant,
            sigma2,
            aic,
            train: work,
            residuals,
            regular_tails,
            seasonal_tails,
        })
    }

    /// Point forecast `h` steps ahead, on the original scale.
    pub fn forecast(&self, h: usize) -> Vec<f64> {
        let mut extended = self.train.clone();
        let mut residuals = self.residuals.clone();
        let mut diffed = Vec::with_capacity(h);

        for _ in 0..h {
            let mut value = self.constant;
            for &(lag, coef) in &self.ar {
                if extended.len() >= lag {
                    value += coef * extended[extended.len() - lag];
                }
            }
            for &(lag, coef) in &self.ma {
                if residuals.len() >= lag {
                    value += coef * residuals[residuals.len() - lag];
                }
            }
            extended.push(value);
            residuals.push(0.0); // future shocks at their expectation
            diffed.push(value);
        }

        // Invert differencing: regular first (applied last), then seasonal.
        let mut out = diffed;
        for tail in self.regular_tails.iter().rev() {
            out = integrate(&out, *tail);
        }
        let s = self.params.seasonal_order.3;
        for tails in self.seasonal_tails.iter().rev() {
            let mut inv = Vec::with_capacity(out.len());
            for (i, &v) in out.iter().enumerate() {
                let base = if i < s { tails[i] } else { inv[i - s] };
                inv.push(v + base);
            }
            out = inv;
        }
        out
    }

    /// Forecast with a two-sided confidence interval.
    ///
    /// Standard errors come from the psi-weight recursion of the fitted
    /// ARMA, cumulated once per order of integration so the interval
    /// widens with the horizon.
    pub fn forecast_interval(&self, h: usize, confidence: f64) -> ForecastInterval {
        let point = self.forecast(h);

        let z = match confidence {
            c if c >= 0.99 => 2.576,
            c if c >= 0.95 => 1.96,
            c if c >= 0.90 => 1.645,
            _ => 1.96,
        };

        // psi_0 = 1; psi_j = theta_j + sum over AR lags of phi * psi_{j-lag}.
        let mut psi = Vec::with_capacity(h);
        for j in 0..h {
            let mut v = if j == 0 { 1.0 } else { 0.0 };
            if j > 0 {
                if let Some(&(_, coef)) = self.ma.iter().find(|(lag, _)| *lag == j) {
                    v += coef;
                }
                for &(lag, coef) in &self.ar {
                    if j >= lag {
                        v += coef * psi[j - lag];
                    }
                }
            }
            psi.push(v);
        }

        let integration_order = self.params.order.1 + self.params.seasonal_order.1;
        for _ in 0..integration_order {
            for i in 1..psi.len() {
                psi[i] += psi[i - 1];
            }
        }

        let sigma = self.sigma2.max(0.0);
        let mut cum_var = 0.0;
        let mut lower = Vec::with_capacity(h);
        let mut upper = Vec::with_capacity(h);
        for (i, &mean) in point.iter().enumerate() {
            cum_var += sigma * psi[i] * psi[i];
            let se = cum_var.sqrt();
            lower.push(mean - z * se);
            upper.push(mean + z * se);
        }

        ForecastInterval {
            point,
            lower,
            upper,
            confidence,
        }
    }

    /// Human-readable model summary for logging.
    pub fn summary(&self) -> String {
        let (p, d, q) = self.params.order;
        let (sp, sd, sq, s) = self.params.seasonal_order;
        let mut out = format!("SARIMA({p},{d},{q})x({sp},{sd},{sq},{s})");
        for (lag, coef) in &self.ar {
            out.push_str(&format!(" phi[{lag}]={coef:.4}"));
        }
        for (lag, coef) in &self.ma {
            out.push_str(&format!(" theta[{lag}]={coef:.4}"));
        }
        out.push_str(&format!(
            " const={:.4} sigma2={:.4} aic={:.1}",
            self.constant, self.sigma2, self.aic
        ));
        out
    }
}

// ---------------------------------------------------------------------------
// Differencing helpers
// ---------------------------------------------------------------------------

/// First difference: `y[t] - y[t-1]`.
fn difference(data: &[f64]) -> Vec<f64> {
    data.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Seasonal difference at lag `s`: `y[t] - y[t-s]`.
fn seasonal_difference(data: &[f64], s: usize) -> Vec<f64> {
    (s..data.len()).map(|t| data[t] - data[t - s]).collect()
}

/// Inverse of `difference`: cumulative sum anchored at `start`.
fn integrate(diff: &[f64], start: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(diff.len());
    let mut acc = start;
    for &d in diff {
        acc += d;
        out.push(acc);
    }
    out
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Estimate ARMA coefficients for the given lag sets.
///
/// Pure AR (no MA lags) is a single OLS pass. With MA lags, the
/// Hannan–Rissanen two-step is used: a long autoregression first provides
/// residual estimates, which then enter the final regression as the MA
/// regressors. Returns (ar, ma, constant, residuals-aligned-with-input).
fn estimate(
    data: &[f64],
    ar_lags: &[usize],
    ma_lags: &[usize],
) -> Result<(Vec<(usize, f64)>, Vec<(usize, f64)>, f64, Vec<f64>)> {
    let n = data.len();

    if ar_lags.is_empty() && ma_lags.is_empty() {
        // Mean model.
        if n == 0 {
            bail!("Empty series");
        }
        let mean = data.iter().sum::<f64>() / n as f64;
        let residuals = data.iter().map(|x| x - mean).collect();
        return Ok((Vec::new(), Vec::new(), mean, residuals));
    }

    let max_ar = ar_lags.last().copied().unwrap_or(0);
    let max_ma = ma_lags.last().copied().unwrap_or(0);

    let proxy_residuals = if ma_lags.is_empty() {
        None
    } else {
        // Step 1: long AR for residual proxies.
        let long_order = (max_ar + max_ma).max(3).min(n / 3);
        if long_order == 0 {
            bail!("Series too short for MA estimation ({n} observations)");
        }
        let long_lags: Vec<usize> = (1..=long_order).collect();
        let (_, _, _, resid) = regress(data, &long_lags, &[], None)?;
        Some(resid)
    };

    regress(data, ar_lags, ma_lags, proxy_residuals.as_deref())
}

/// OLS regression of `data[t]` on a constant, its own values at `ar_lags`,
/// and residual proxies at `ma_lags`. Residuals in the returned vector are
/// aligned with `data`, zero outside the estimation window.
fn regress(
    data: &[f64],
    ar_lags: &[usize],
    ma_lags: &[usize],
    proxy_residuals: Option<&[f64]>,
) -> Result<(Vec<(usize, f64)>, Vec<(usize, f64)>, f64, Vec<f64>)> {
    let n = data.len();
    let max_ar = ar_lags.last().copied().unwrap_or(0);
    let max_ma = ma_lags.last().copied().unwrap_or(0);
    let start = max_ar.max(max_ma);
    let cols = 1 + ar_lags.len() + ma_lags.len();

    if n < start + cols + 1 {
        bail!("Not enough observations for regression: have {n}, need {}", start + cols + 1);
    }
    let rows = n - start;

    let mut x_data = Vec::with_capacity(rows * cols);
    let mut y_data = Vec::with_capacity(rows);
    for t in start..n {
        y_data.push(data[t]);
        x_data.push(1.0);
        for &lag in ar_lags {
            x_data.push(data[t - lag]);
        }
        for &lag in ma_lags {
            let proxies = proxy_residuals.expect("MA lags require proxy residuals");
            x_data.push(proxies.get(t - lag).copied().unwrap_or(0.0));
        }
    }

    let x = DMatrix::from_row_slice(rows, cols, &x_data);
    let y = DVector::from_vec(y_data);

    let xtx = x.transpose() * &x;
    let xty = x.transpose() * &y;
    let Some(xtx_inv) = xtx.try_inverse() else {
        bail!("Singular design matrix — series has no usable variation");
    };
    let beta = xtx_inv * xty;

    let constant = beta[0];
    let ar: Vec<(usize, f64)> = ar_lags
        .iter()
        .zip(beta.iter().skip(1))
        .map(|(&lag, &c)| (lag, c))
        .collect();
    let ma: Vec<(usize, f64)> = ma_lags
        .iter()
        .zip(beta.iter().skip(1 + ar_lags.len()))
        .map(|(&lag, &c)| (lag, c))
        .collect();

    let fitted = &x * &beta;
    let mut residuals = vec![0.0; n];
    for (i, t) in (start..n).enumerate() {
        residuals[t] = y[i] - fitted[i];
    }

    Ok((ar, ma, constant, residuals))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
