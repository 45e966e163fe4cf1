//! Exchange-agnostic interface for historical kline providers.
//!
//! Both legs of a hedge are priced from one-minute candles. Each exchange
//! client implements [`KlineProvider`] so the cache-aware fetcher can treat
//! them uniformly (and so tests can substitute a mock).

use async_trait::async_trait;

use super::types::{Candle, Exchange, KlineError};

/// Source of one-minute OHLCV candles for a single exchange.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KlineProvider: Send + Sync {
    /// Returns the exchange this provider serves.
    fn exchange(&self) -> Exchange;

    /// Fetch all one-minute candles with open time in `[start_ms, end_ms]`.
    ///
    /// Implementations handle pagination internally and return candles
    /// sorted ascending with unique timestamps.
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, KlineError>;
}
