//! Cache-aware, concurrent candle fetcher.
//!
//! For each `(symbol, exchange, range)` request the fetcher checks the SQLite
//! cache, downloads only the missing periods (with retry and backoff), stores
//! them, and then serves the range from the cache. A failure on one
//! symbol/exchange is recorded as [`CandleSeries::Insufficient`] and never
//! aborts the other requests.

use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::traits::KlineProvider;
use super::types::{Candle, Exchange};
use crate::persistence::{CacheCoverage, CandleCache};
use crate::utils::{retry_with_backoff, RetryConfig};

/// Trailing gaps shorter than this are treated as timestamp jitter.
pub const MIN_TRAILING_GAP_MS: i64 = 120_000;

/// Candle data for one `(symbol, exchange)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum CandleSeries {
    /// Candles sorted ascending with unique timestamps.
    Available(Vec<Candle>),
    /// No usable data; the reason is kept for reporting.
    Insufficient { reason: String },
}

impl CandleSeries {
    /// Candles if available.
    pub fn candles(&self) -> Option<&[Candle]> {
        match self {
            CandleSeries::Available(c) => Some(c),
            CandleSeries::Insufficient { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, CandleSeries::Available(_))
    }

    fn insufficient(reason: impl Into<String>) -> Self {
        CandleSeries::Insufficient {
            reason: reason.into(),
        }
    }
}

/// Candle series for every requested symbol and exchange.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: BTreeMap<String, BTreeMap<Exchange, CandleSeries>>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the series for a pair, replacing any previous one.
    pub fn insert(&mut self, symbol: &str, exchange: Exchange, series: CandleSeries) {
        self.series
            .entry(symbol.to_string())
            .or_default()
            .insert(exchange, series);
    }

    /// Convenience for building in-memory data sets.
    pub fn with_candles(mut self, symbol: &str, exchange: Exchange, candles: Vec<Candle>) -> Self {
        self.insert(symbol, exchange, CandleSeries::Available(candles));
        self
    }

    /// Candles for a pair, if available.
    pub fn candles(&self, symbol: &str, exchange: Exchange) -> Option<&[Candle]> {
        self.series
            .get(symbol)
            .and_then(|by_exchange| by_exchange.get(&exchange))
            .and_then(|s| s.candles())
    }

    /// Series for a pair, if it was requested.
    pub fn series(&self, symbol: &str, exchange: Exchange) -> Option<&CandleSeries> {
        self.series.get(symbol).and_then(|m| m.get(&exchange))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }

    /// Number of pairs with usable candles.
    pub fn available_count(&self) -> usize {
        self.series
            .values()
            .flat_map(|m| m.values())
            .filter(|s| s.is_available())
            .count()
    }

    /// `(symbol, exchange, reason)` for every pair without usable candles.
    pub fn insufficient(&self) -> Vec<(String, Exchange, String)> {
        let mut out = Vec::new();
        for (symbol, by_exchange) in &self.series {
            for (exchange, series) in by_exchange {
                if let CandleSeries::Insufficient { reason } = series {
                    out.push((symbol.clone(), *exchange, reason.clone()));
                }
            }
        }
        out
    }

    /// Symbols for which at least one exchange has no data at all.
    ///
    /// Every opportunity on such a symbol is unpriceable.
    pub fn unpriceable_symbols(&self) -> Vec<String> {
        self.series
            .iter()
            .filter(|(_, by_exchange)| {
                Exchange::ALL
                    .iter()
                    .any(|e| !by_exchange.get(e).is_some_and(|s| s.is_available()))
            })
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }
}

/// A range of candles to make available for one symbol on both exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Why a period has to be downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    /// Nothing cached for the pair.
    Full,
    /// Requested start precedes the cached span.
    Before,
    /// Requested end follows the cached span.
    After,
}

/// A period missing from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPeriod {
    pub start_ms: i64,
    pub end_ms: i64,
    pub kind: PeriodKind,
}

/// Work out which parts of `[start_ms, end_ms]` the cache does not cover.
pub fn missing_periods(
    coverage: Option<CacheCoverage>,
    start_ms: i64,
    end_ms: i64,
) -> Vec<FetchPeriod> {
    let Some(cov) = coverage else {
        return vec![FetchPeriod {
            start_ms,
            end_ms,
            kind: PeriodKind::Full,
        }];
    };

    let mut periods = Vec::new();

    if start_ms < cov.first_ms {
        periods.push(FetchPeriod {
            start_ms,
            end_ms: cov.first_ms.min(end_ms),
            kind: PeriodKind::Before,
        });
    }

    if end_ms > cov.last_ms && end_ms - cov.last_ms >= MIN_TRAILING_GAP_MS {
        periods.push(FetchPeriod {
            start_ms: cov.last_ms.max(start_ms),
            end_ms,
            kind: PeriodKind::After,
        });
    }

    periods
}

/// Concurrent, cache-aware candle fetcher.
pub struct CandleFetcher {
    providers: HashMap<Exchange, Arc<dyn KlineProvider>>,
    cache: Arc<Mutex<CandleCache>>,
    retry: RetryConfig,
    concurrency_per_exchange: usize,
    offline: bool,
}

impl CandleFetcher {
    /// Create a fetcher over `cache` with no providers registered.
    pub fn new(cache: CandleCache, retry: RetryConfig, concurrency_per_exchange: usize) -> Self {
        Self {
            providers: HashMap::new(),
            cache: Arc::new(Mutex::new(cache)),
            retry,
            concurrency_per_exchange: concurrency_per_exchange.max(1),
            offline: false,
        }
    }

    /// Register the kline provider for its exchange.
    pub fn with_provider(mut self, provider: Arc<dyn KlineProvider>) -> Self {
        self.providers.insert(provider.exchange(), provider);
        self
    }

    /// Serve from the cache only, never touching the network.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Shared handle to the underlying cache.
    pub fn cache(&self) -> Arc<Mutex<CandleCache>> {
        Arc::clone(&self.cache)
    }

    /// Make `[start_ms, end_ms]` available for one pair and return it.
    pub async fn fetch_series(
        &self,
        symbol: &str,
        exchange: Exchange,
        start_ms: i64,
        end_ms: i64,
    ) -> CandleSeries {
        let coverage = match self.cache.lock().await.coverage(symbol, exchange) {
            Ok(c) => c,
            Err(e) => {
                warn!(symbol, exchange = %exchange, error = %e, "Cache read failed");
                None
            }
        };

        let periods = missing_periods(coverage, start_ms, end_ms);
        let mut last_error: Option<String> = None;

        if !periods.is_empty() && !self.offline {
            match self.providers.get(&exchange) {
                Some(provider) => {
                    for period in &periods {
                        if let Err(e) = self.fetch_period(provider.as_ref(), symbol, period).await
                        {
                            last_error = Some(e);
                        }
                    }
                }
                None => last_error = Some(format!("no kline provider for {}", exchange)),
            }
        } else if coverage.is_some() {
            debug!(symbol, exchange = %exchange, "Serving candles from cache");
        }

        let loaded = self
            .cache
            .lock()
            .await
            .load_range(symbol, exchange, start_ms, end_ms);

        match loaded {
            Ok(candles) if !candles.is_empty() => CandleSeries::Available(candles),
            Ok(_) => CandleSeries::insufficient(
                last_error.unwrap_or_else(|| "no candles in requested range".to_string()),
            ),
            Err(e) => CandleSeries::insufficient(format!("cache read failed: {}", e)),
        }
    }

    /// Download one missing period and store it.
    async fn fetch_period(
        &self,
        provider: &dyn KlineProvider,
        symbol: &str,
        period: &FetchPeriod,
    ) -> Result<(), String> {
        let exchange = provider.exchange();
        let context = format!("{} {} klines", exchange, symbol);
        let (start_ms, end_ms) = (period.start_ms, period.end_ms);

        debug!(
            symbol,
            exchange = %exchange,
            kind = ?period.kind,
            start_ms,
            end_ms,
            "Fetching missing period"
        );

        let candles = retry_with_backoff(
            move || provider.fetch_klines(symbol, start_ms, end_ms),
            &self.retry,
            &context,
        )
        .await
        .map_err(|e| {
            warn!(symbol, exchange = %exchange, error = %e, "Kline fetch failed");
            e.to_string()
        })?;

        if candles.is_empty() {
            return Ok(());
        }

        self.cache
            .lock()
            .await
            .insert_candles(symbol, exchange, &candles)
            .map_err(|e| {
                warn!(symbol, exchange = %exchange, error = %e, "Cache write failed");
                e.to_string()
            })?;

        Ok(())
    }

    /// Fetch every request on every registered exchange.
    ///
    /// At most `concurrency_per_exchange` requests per exchange are in flight.
    pub async fn fetch_all(&self, requests: &[FetchRequest]) -> MarketData {
        let semaphores: HashMap<Exchange, Arc<Semaphore>> = Exchange::ALL
            .iter()
            .map(|e| (*e, Arc::new(Semaphore::new(self.concurrency_per_exchange))))
            .collect();

        let jobs: Vec<(&FetchRequest, Exchange)> = requests
            .iter()
            .flat_map(|r| Exchange::ALL.iter().map(move |e| (r, *e)))
            .collect();
        let total = jobs.len();

        info!(
            requests = requests.len(),
            jobs = total,
            concurrency_per_exchange = self.concurrency_per_exchange,
            offline = self.offline,
            "Fetching candles"
        );

        let results: Vec<(String, Exchange, CandleSeries)> = stream::iter(jobs)
            .map(|(request, exchange)| {
                let semaphore = semaphores.get(&exchange).cloned();
                async move {
                    let _permit = match semaphore {
                        Some(s) => s.acquire_owned().await.ok(),
                        None => None,
                    };
                    let series = self
                        .fetch_series(&request.symbol, exchange, request.start_ms, request.end_ms)
                        .await;
                    (request.symbol.clone(), exchange, series)
                }
            })
            .buffer_unordered(self.concurrency_per_exchange * Exchange::ALL.len())
            .collect()
            .await;

        let mut market = MarketData::new();
        for (symbol, exchange, series) in results {
            market.insert(&symbol, exchange, series);
        }

        let insufficient = market.insufficient();
        for (symbol, exchange, reason) in &insufficient {
            warn!(symbol = %symbol, exchange = %exchange, reason = %reason, "No candle data");
        }
        info!(
            available = market.available_count(),
            insufficient = insufficient.len(),
            "Candle fetch complete"
        );

        market
    }
}
