//! Binance spot public kline client.
//!
//! Fetches one-minute candles from `/api/v3/klines`, paging forward from
//! the requested start until the end of the range is reached.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

use super::traits::KlineProvider;
use super::types::{
    decimal_from_value, normalize_candles, read_kline_body, Candle, Exchange, KlineError,
};

/// Base URL for the Binance public API.
const BINANCE_API_URL: &str = "https://api.binance.com";

/// Maximum rows Binance returns per kline request.
const BINANCE_LIMIT: usize = 1000;

/// Read-only Binance kline client.
#[derive(Debug, Clone)]
pub struct BinanceKlineClient {
    client: Client,
    base_url: String,
    page_limit: usize,
}

impl BinanceKlineClient {
    /// Create a new client against the production API.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(BINANCE_API_URL, Duration::from_secs(30))
    }

    /// Create a client with a custom base URL and request timeout.
    pub fn with_base_url(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_limit: BINANCE_LIMIT,
        })
    }

    /// Override the page size (mainly for tests).
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, BINANCE_LIMIT);
        self
    }

    /// Fetch a single page of klines starting at `start_ms`.
    async fn fetch_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, KlineError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", "1m".to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", self.page_limit.to_string()),
        ];

        let response = self.client.get(&url).query(&query).send().await?;
        let body = read_kline_body(Exchange::Binance, symbol, response).await?;

        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)
            .map_err(|e| KlineError::Decode(format!("binance klines: {}", e)))?;

        rows.iter().map(|row| parse_row(row)).collect()
    }
}

#[async_trait]
impl KlineProvider for BinanceKlineClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    #[instrument(skip(self), name = "binance_klines")]
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, KlineError> {
        let mut candles = Vec::new();
        let mut cursor = start_ms;
        let mut pages = 0usize;

        while cursor <= end_ms {
            let page = self.fetch_page(symbol, cursor, end_ms).await?;
            pages += 1;

            let Some(last) = page.last() else {
                break;
            };
            let next_cursor = last.timestamp + 1;
            let full_page = page.len() >= self.page_limit;
            candles.extend(page);

            if !full_page || next_cursor <= cursor {
                break;
            }
            cursor = next_cursor;
        }

        let candles: Vec<Candle> = normalize_candles(candles)
            .into_iter()
            .filter(|c| c.timestamp >= start_ms && c.timestamp <= end_ms)
            .collect();

        debug!(
            symbol,
            pages,
            candles = candles.len(),
            "Fetched Binance klines"
        );
        Ok(candles)
    }
}

/// Parse one Binance kline row:
/// `[open_time, open, high, low, close, volume, close_time, ...]`.
fn parse_row(row: &[serde_json::Value]) -> Result<Candle, KlineError> {
    if row.len() < 6 {
        return Err(KlineError::Decode(format!(
            "binance kline row has {} fields, expected at least 6",
            row.len()
        )));
    }

    let timestamp = row[0]
        .as_i64()
        .ok_or_else(|| KlineError::Decode(format!("invalid open time: {}", row[0])))?;

    Ok(Candle {
        timestamp,
        open: decimal_from_value(&row[1])?,
        high: decimal_from_value(&row[2])?,
        low: decimal_from_value(&row[3])?,
        close: decimal_from_value(&row[4])?,
        volume: decimal_from_value(&row[5])?,
    })
}
