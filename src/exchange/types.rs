//! Shared market data types for the Binance and Bybit kline feeds.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One minute in milliseconds.
pub const MINUTE_MS: i64 = 60_000;

/// Exchange identifier for the two legs of a hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
}

impl Exchange {
    /// Both exchanges, in a fixed order.
    pub const ALL: [Exchange; 2] = [Exchange::Binance, Exchange::Bybit];

    /// Lowercase key used in caches and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
        }
    }

    /// The other exchange of the pair.
    pub fn counterpart(&self) -> Exchange {
        match self {
            Exchange::Binance => Exchange::Bybit,
            Exchange::Bybit => Exchange::Binance,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Binance => write!(f, "Binance"),
            Exchange::Bybit => write!(f, "Bybit"),
        }
    }
}

impl FromStr for Exchange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" | "bn" => Ok(Exchange::Binance),
            "bybit" | "by" => Ok(Exchange::Bybit),
            other => anyhow::bail!("Unknown exchange: {}", other),
        }
    }
}

/// A one-minute OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds (UTC)
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Base asset volume
    pub volume: Decimal,
}

impl Candle {
    /// Typical price `(high + low + close) / 3`.
    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }
}

/// Sort ascending and drop repeated timestamps, keeping the first occurrence.
pub fn normalize_candles(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.timestamp);
    candles.dedup_by_key(|c| c.timestamp);
    candles
}

/// Errors raised by the kline HTTP clients.
#[derive(Debug, Error)]
pub enum KlineError {
    /// The exchange does not list the symbol (HTTP 400 or equivalent code).
    #[error("{exchange} does not list {symbol}")]
    InvalidSymbol { exchange: Exchange, symbol: String },

    /// Rate limit or IP ban response (HTTP 418/429).
    #[error("{0} rate limit hit")]
    RateLimited(Exchange),

    /// Any other non-success HTTP status.
    #[error("{exchange} API error {status}: {body}")]
    Http {
        exchange: Exchange,
        status: u16,
        body: String,
    },

    /// Exchange-level error code inside a 200 response.
    #[error("{exchange} returned code {code}: {message}")]
    Api {
        exchange: Exchange,
        code: i64,
        message: String,
    },

    /// Network or timeout failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body could not be interpreted as klines.
    #[error("malformed kline payload: {0}")]
    Decode(String),
}

impl KlineError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            KlineError::RateLimited(_) | KlineError::Transport(_) => true,
            KlineError::Http { status, .. } => *status >= 500,
            KlineError::Api { .. } | KlineError::InvalidSymbol { .. } | KlineError::Decode(_) => {
                false
            }
        }
    }
}

/// Map a kline HTTP response to its body, classifying failure statuses.
pub(crate) async fn read_kline_body(
    exchange: Exchange,
    symbol: &str,
    response: reqwest::Response,
) -> Result<String, KlineError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response.text().await?),
        400 => Err(KlineError::InvalidSymbol {
            exchange,
            symbol: symbol.to_string(),
        }),
        403 | 418 | 429 => Err(KlineError::RateLimited(exchange)),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(KlineError::Http {
                exchange,
                status,
                body,
            })
        }
    }
}

/// Raw Bybit v5 kline response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitKlineResponse {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: Option<BybitKlineResult>,
}

/// `result` section of a Bybit kline response.
#[derive(Debug, Clone, Deserialize)]
pub struct BybitKlineResult {
    #[serde(default)]
    pub list: Vec<Vec<String>>,
}

/// Parse a decimal that the exchange may send as a string or a number.
pub(crate) fn decimal_from_value(value: &serde_json::Value) -> Result<Decimal, KlineError> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s)
            .map_err(|e| KlineError::Decode(format!("invalid decimal '{}': {}", s, e))),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| KlineError::Decode(format!("invalid decimal '{}': {}", n, e))),
        other => Err(KlineError::Decode(format!("expected decimal, got {}", other))),
    }
}
