//! CryptoCompare price data client.
//!
//! Fetches minute and daily BTC/USD OHLCV bars from the CryptoCompare
//! `histominute` / `histoday` endpoints.
//!
//! API: `https://min-api.cryptocompare.com/data/v2/{histominute,histoday}`
//! Auth: API key via `authorization: Apikey <key>` header. Free tier is
//! sufficient for a single-pair poller.
//!
//! The response wraps the bars in an envelope with a `Response` status
//! field; anything other than `"Success"` is surfaced as `FetchError::Api`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{FetchError, PriceSource};
use crate::types::{DailyBar, PriceObservation};

const MINUTE_URL: &str = "https://min-api.cryptocompare.com/data/v2/histominute";
const DAILY_URL: &str = "https://min-api.cryptocompare.com/data/v2/histoday";

// ---------------------------------------------------------------------------
// Raw API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(rename = "Response", default)]
    response: String,
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Data", default)]
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiData {
    #[serde(rename = "Data", default)]
    bars: Vec<RawBar>,
}

/// One OHLCV bar as CryptoCompare returns it. `time` is unix seconds,
/// `volumefrom` is base-currency (BTC) volume, `volumeto` quote (USD).
#[derive(Debug, Deserialize)]
struct RawBar {
    time: i64,
    #[serde(default)]
    open: f64,
    #[serde(default)]
    high: f64,
    #[serde(default)]
    low: f64,
    #[serde(default)]
    close: f64,
    #[serde(default)]
    volumefrom: f64,
    #[serde(default)]
    volumeto: f64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct CryptoCompareClient {
    http: Client,
    api_key: String,
    fsym: String,
    tsym: String,
}

impl CryptoCompareClient {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("btcwatch/0.1.0")
            .build()?;
        Ok(Self {
            http,
            api_key,
            fsym: "BTC".to_string(),
            tsym: "USD".to_string(),
        })
    }

    /// Fetch one chunk of raw bars from the given endpoint.
    async fn fetch_chunk(
        &self,
        endpoint: &str,
        limit: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<RawBar>, FetchError> {
        let mut params = vec![
            ("fsym", self.fsym.clone()),
            ("tsym", self.tsym.clone()),
            ("limit", limit.to_string()),
        ];
        if let Some(ts) = to_ts {
            params.push(("toTs", ts.to_string()));
        }

        let resp = self
            .http
            .get(endpoint)
            .query(&params)
            .header("authorization", format!("Apikey {}", self.api_key))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ApiEnvelope = resp.json().await?;
        if envelope.response != "Success" {
            return Err(FetchError::Api(if envelope.message.is_empty() {
                "Unknown".to_string()
            } else {
                envelope.message
            }));
        }

        let bars = envelope.data.unwrap_or_default().bars;
        debug!(endpoint, limit, ?to_ts, count = bars.len(), "Chunk fetched");
        Ok(bars)
    }
}

fn to_utc(unix: i64) -> DateTime<Utc> {
    // CryptoCompare timestamps are always in-range unix seconds.
    Utc.timestamp_opt(unix, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

#[async_trait]
impl PriceSource for CryptoCompareClient {
    async fn fetch_minute_bars(
        &self,
        limit: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<PriceObservation>, FetchError> {
        let raw = self.fetch_chunk(MINUTE_URL, limit, to_ts).await?;
        Ok(raw
            .into_iter()
            .map(|b| PriceObservation {
                timestamp: to_utc(b.time),
                price_usd: b.close,
                volume_usd: b.volumeto,
                volume_btc: b.volumefrom,
            })
            .collect())
    }

    async fn fetch_daily_bars(
        &self,
        limit: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<DailyBar>, FetchError> {
        // The API returns limit+1 bars (endpoints are inclusive), so ask
        // for one less, never below 1.
        let raw = self
            .fetch_chunk(DAILY_URL, (limit - 1).max(1), to_ts)
            .await?;
        Ok(raw
            .into_iter()
            .map(|b| DailyBar {
                date: to_utc(b.time).date_naive(),
                open_usd: b.open,
                high_usd: b.high,
                low_usd: b.low,
                close_usd: b.close,
                volume_usd: b.volumeto,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "cryptocompare"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
