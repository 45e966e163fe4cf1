//! Bybit v5 linear-perpetual kline client.
//!
//! Bybit returns klines newest-first, so pages are walked backwards from the
//! end of the requested range.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

use super::traits::KlineProvider;
use super::types::{
    normalize_candles, read_kline_body, BybitKlineResponse, Candle, Exchange, KlineError,
};

/// Base URL for the Bybit public API.
const BYBIT_API_URL: &str = "https://api.bybit.com";

/// Maximum rows Bybit returns per kline request.
const BYBIT_LIMIT: usize = 200;

/// Bybit retCode for an invalid request parameter (unknown symbol).
const RET_CODE_PARAMS_ERROR: i64 = 10001;

/// Bybit retCode for too many visits.
const RET_CODE_RATE_LIMIT: i64 = 10006;

/// Read-only Bybit kline client.
#[derive(Debug, Clone)]
pub struct BybitKlineClient {
    client: Client,
    base_url: String,
    page_limit: usize,
}

impl BybitKlineClient {
    /// Create a new client against the production API.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(BYBIT_API_URL, Duration::from_secs(30))
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
            page_limit: BYBIT_LIMIT,
        })
    }

    /// Override the page size (mainly for tests).
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, BYBIT_LIMIT);
        self
    }

    /// Fetch a single page of klines ending at `end_ms`.
    async fn fetch_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, KlineError> {
        let url = format!("{}/v5/market/kline", self.base_url);
        let query = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("interval", "1".to_string()),
            ("start", start_ms.to_string()),
            ("end", end_ms.to_string()),
            ("limit", self.page_limit.to_string()),
        ];

        let response = self.client.get(&url).query(&query).send().await?;
        let body = read_kline_body(Exchange::Bybit, symbol, response).await?;

        let parsed: BybitKlineResponse = serde_json::from_str(&body)
            .map_err(|e| KlineError::Decode(format!("bybit klines: {}", e)))?;

        match parsed.ret_code {
            0 => {}
            RET_CODE_PARAMS_ERROR => {
                return Err(KlineError::InvalidSymbol {
                    exchange: Exchange::Bybit,
                    symbol: symbol.to_string(),
                })
            }
            RET_CODE_RATE_LIMIT => return Err(KlineError::RateLimited(Exchange::Bybit)),
            code => {
                return Err(KlineError::Api {
                    exchange: Exchange::Bybit,
                    code,
                    message: parsed.ret_msg,
                })
            }
        }

        parsed
            .result
            .map(|r| r.list)
            .unwrap_or_default()
            .iter()
            .map(|row| parse_row(row))
            .collect()
    }
}

#[async_trait]
impl KlineProvider for BybitKlineClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    #[instrument(skip(self), name = "bybit_klines")]
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, KlineError> {
        let mut candles = Vec::new();
        let mut cursor = end_ms;
        let mut pages = 0usize;

        while cursor >= start_ms {
            let page = self.fetch_page(symbol, start_ms, cursor).await?;
            pages += 1;

            let Some(oldest) = page.iter().map(|c| c.timestamp).min() else {
                break;
            };
            let full_page = page.len() >= self.page_limit;
            candles.extend(page);

            if !full_page || oldest <= start_ms || oldest - 1 >= cursor {
                break;
            }
            cursor = oldest - 1;
        }

        let candles: Vec<Candle> = normalize_candles(candles)
            .into_iter()
            .filter(|c| c.timestamp >= start_ms && c.timestamp <= end_ms)
            .collect();

        debug!(
            symbol,
            pages,
            candles = candles.len(),
            "Fetched Bybit klines"
        );
        Ok(candles)
    }
}

/// Parse one Bybit kline row:
/// `[start_time, open, high, low, close, volume, turnover]`, all strings.
fn parse_row(row: &[String]) -> Result<Candle, KlineError> {
    if row.len() < 6 {
        return Err(KlineError::Decode(format!(
            "bybit kline row has {} fields, expected at least 6",
            row.len()
        )));
    }

    let timestamp = row[0]
        .parse::<i64>()
        .map_err(|e| KlineError::Decode(format!("invalid start time '{}': {}", row[0], e)))?;

    let field = |i: usize| {
        Decimal::from_str(&row[i])
            .map_err(|e| KlineError::Decode(format!("invalid decimal '{}': {}", row[i], e)))
    };

    Ok(Candle {
        timestamp,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}
