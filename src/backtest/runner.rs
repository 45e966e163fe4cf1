//! End-to-end backtest pipeline.
//!
//! load timeline -> fetch/cache candles -> attach VWAPs -> simulate -> report.
//! VWAP attachment runs one task per symbol, bounded by a semaphore, and
//! results are re-joined by original index before the sequential engine runs.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::data::{LoadedOpportunities, LoaderOptions, LoaderSummary, OpportunitySource, TimelineLoader};
use super::engine::{BacktestResult, SimulationEngine};
use super::opportunity::Opportunity;
use super::vwap::{apply_quotes, VwapCalculator, VwapQuoteSet, VwapStats};
use crate::config::Config;
use crate::exchange::{
    BinanceKlineClient, BybitKlineClient, CandleFetcher, FetchRequest, MarketData, MINUTE_MS,
};
use crate::persistence::CandleCache;

/// Everything produced by one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub loader: LoaderSummary,
    pub vwap: VwapStats,
    /// Symbols missing candle data on at least one exchange
    pub unpriceable_symbols: Vec<String>,
    pub result: BacktestResult,
}

/// One request per symbol covering every VWAP window it needs, padded by a
/// minute on each side.
pub fn fetch_requests(opportunities: &[Opportunity], window_minutes: u32) -> Vec<FetchRequest> {
    let pad = (i64::from(window_minutes) + 1) * MINUTE_MS;

    let mut ranges: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    for opp in opportunities {
        ranges
            .entry(opp.symbol.as_str())
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(opp.timestamp);
                *hi = (*hi).max(opp.timestamp);
            })
            .or_insert((opp.timestamp, opp.timestamp));
    }

    ranges
        .into_iter()
        .map(|(symbol, (lo, hi))| FetchRequest {
            symbol: symbol.to_string(),
            start_ms: lo - pad,
            end_ms: hi + pad,
        })
        .collect()
}

/// Compute VWAPs concurrently per symbol and attach them in input order.
pub async fn attach_vwaps_parallel(
    calculator: VwapCalculator,
    opportunities: &mut [Opportunity],
    market: Arc<MarketData>,
    parallelism: usize,
) -> VwapStats {
    let mut by_symbol: BTreeMap<String, Vec<(usize, Opportunity)>> = BTreeMap::new();
    for (i, opp) in opportunities.iter().enumerate() {
        by_symbol
            .entry(opp.symbol.clone())
            .or_default()
            .push((i, opp.clone()));
    }

    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut handles = Vec::with_capacity(by_symbol.len());

    for (symbol, batch) in by_symbol {
        let sem = Arc::clone(&semaphore);
        let market = Arc::clone(&market);

        let handle = tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            batch
                .iter()
                .map(|(i, opp)| (*i, calculator.quotes_for(opp, &market)))
                .collect::<Vec<(usize, VwapQuoteSet)>>()
        });
        handles.push((symbol, handle));
    }

    let mut sets: Vec<Option<VwapQuoteSet>> = vec![None; opportunities.len()];
    for (symbol, handle) in handles {
        match handle.await {
            Ok(results) => {
                for (i, set) in results {
                    sets[i] = Some(set);
                }
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "VWAP task failed"),
        }
    }

    let mut stats = VwapStats::default();
    for (opp, set) in opportunities.iter_mut().zip(sets) {
        match set {
            Some(set) => apply_quotes(opp, &set, &mut stats),
            None => {
                stats.total += 1;
                stats.unpriced += 1;
                *stats.reasons.entry("task_failed".to_string()).or_default() += 1;
            }
        }
    }

    info!(
        total = stats.total,
        priced = stats.priced,
        unpriced = stats.unpriced,
        "VWAP attachment complete ({:.1}% priced)",
        stats.priced_pct()
    );
    stats
}

/// Drives a complete backtest from configuration.
pub struct BacktestRunner {
    config: Config,
    offline: bool,
}

impl BacktestRunner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            offline: false,
        }
    }

    /// Use cached candles only.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetcher over the configured cache with both exchange clients.
    pub fn build_fetcher(&self) -> Result<CandleFetcher> {
        let cache = CandleCache::new(&self.config.data.cache_path)?;
        let timeout = Duration::from_secs(self.config.fetch.request_timeout_secs);

        let binance = BinanceKlineClient::with_base_url(&self.config.fetch.binance_base_url, timeout)?;
        let bybit = BybitKlineClient::with_base_url(&self.config.fetch.bybit_base_url, timeout)?;

        Ok(CandleFetcher::new(
            cache,
            self.config.retry_config(),
            self.config.fetch.concurrency_per_exchange,
        )
        .with_provider(Arc::new(binance))
        .with_provider(Arc::new(bybit))
        .offline(self.offline))
    }

    /// Open the configured timeline source.
    pub fn timeline(&self) -> Result<TimelineLoader> {
        TimelineLoader::new(&self.config.data.timeline_path).with_context(|| {
            format!("Failed to load timeline from {}", self.config.data.timeline_path)
        })
    }

    /// Run the full pipeline against the configured sources.
    pub async fn run(&self) -> Result<RunReport> {
        let source = self.timeline()?;
        let fetcher = self.build_fetcher()?;
        self.run_with(&source, &fetcher).await
    }

    /// Run the pipeline with explicit collaborators.
    pub async fn run_with(
        &self,
        source: &dyn OpportunitySource,
        fetcher: &CandleFetcher,
    ) -> Result<RunReport> {
        let options = LoaderOptions::from_config(&self.config)?;
        let LoadedOpportunities {
            mut opportunities,
            summary,
        } = source.load_opportunities(&options)?;

        if opportunities.is_empty() {
            warn!("No opportunities in the configured range");
        }

        let trading = &self.config.trading;
        let requests = fetch_requests(&opportunities, trading.vwap_window_minutes);
        let market = Arc::new(fetcher.fetch_all(&requests).await);

        let unpriceable_symbols = market.unpriceable_symbols();
        if !unpriceable_symbols.is_empty() {
            warn!(
                count = unpriceable_symbols.len(),
                "Symbols without candle data on both exchanges will be skipped"
            );
        }

        let vwap = attach_vwaps_parallel(
            self.config.vwap_calculator(),
            &mut opportunities,
            market,
            self.config.analysis.vwap_parallelism,
        )
        .await;

        let mut engine = SimulationEngine::new(trading.initial_capital, self.config.fee_schedule());
        let result = engine.run(&opportunities);

        Ok(RunReport {
            loader: summary,
            vwap,
            unpriceable_symbols,
            result,
        })
    }

    /// Download candles for every symbol in the timeline without simulating.
    pub async fn warm_cache(
        &self,
        source: &dyn OpportunitySource,
        fetcher: &CandleFetcher,
    ) -> Result<MarketData> {
        let options = LoaderOptions::from_config(&self.config)?;
        let loaded = source.load_opportunities(&options)?;
        let requests = fetch_requests(&loaded.opportunities, self.config.trading.vwap_window_minutes);

        info!("Warming cache for {} symbol(s)", requests.len());
        Ok(fetcher.fetch_all(&requests).await)
    }

    /// Write the enabled report files and return their paths.
    pub fn save_reports(&self, report: &RunReport) -> Result<Vec<PathBuf>> {
        let output = &self.config.output;
        let dir = PathBuf::from(&output.output_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

        let mut written = Vec::new();

        if output.save_detailed_trades {
            let path = dir.join("trades.csv");
            report.result.trades_to_csv(&path)?;
            written.push(path);
        }

        if output.save_equity_curve {
            let path = dir.join("equity_curve.csv");
            report.result.equity_to_csv(&path)?;
            written.push(path);
        }

        if output.save_summary_json {
            let path = dir.join("summary.json");
            let body = json!({
                "config": self.config,
                "loader": report.loader,
                "vwap": report.vwap,
                "unpriceable_symbols": report.unpriceable_symbols,
                "result": report.result.summary_json(),
            });
            std::fs::write(&path, serde_json::to_string_pretty(&body)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written.push(path);
        }

        for path in &written {
            info!("Report saved to {}", path.display());
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::data::TimelineRow;
    use crate::backtest::engine::SkipReason;
    use crate::exchange::{Candle, Exchange};
    use crate::utils::RetryConfig;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const T0: i64 = 1_754_553_600_000; // 2025-08-07 08:00:00 UTC

    fn opp(symbol: &str, timestamp: i64) -> Opportunity {
        Opportunity::new(timestamp, symbol, dec!(1000), dec!(-0.001), dec!(0), true, false)
    }

    fn flat_candles(price: Decimal, from_min: i64, to_min: i64) -> Vec<Candle> {
        (from_min..=to_min)
            .map(|m| Candle {
                timestamp: T0 + m * MINUTE_MS,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: dec!(1),
            })
            .collect()
    }

    fn row(symbol: &str) -> TimelineRow {
        TimelineRow {
            timestamp: T0,
            symbol: symbol.to_string(),
            binance_rate: dec!(-0.001),
            bybit_rate: dec!(0),
            binance_pays: true,
            bybit_pays: false,
            tradable: true,
            duration_hours: Decimal::ONE,
            mismatch_type: None,
            binance_interval: None,
            bybit_interval: None,
        }
    }

    fn offline_fetcher() -> CandleFetcher {
        let cache = CandleCache::new(":memory:").unwrap();
        cache
            .insert_candles("BTCUSDT", Exchange::Binance, &flat_candles(dec!(100), -10, 10))
            .unwrap();
        cache
            .insert_candles("BTCUSDT", Exchange::Bybit, &flat_candles(dec!(50), -10, 10))
            .unwrap();
        CandleFetcher::new(cache, RetryConfig::default(), 2).offline(true)
    }

    // =========================================================================
    // Fetch Request Tests
    // =========================================================================

    #[test]
    fn test_fetch_requests_cover_windows() {
        let opps = vec![
            opp("BTCUSDT", T0),
            opp("ETHUSDT", T0),
            opp("BTCUSDT", T0 + 60 * MINUTE_MS),
        ];

        let requests = fetch_requests(&opps, 5);

        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0],
            FetchRequest {
                symbol: "BTCUSDT".to_string(),
                start_ms: T0 - 6 * MINUTE_MS,
                end_ms: T0 + 66 * MINUTE_MS,
            }
        );
        assert_eq!(requests[1].symbol, "ETHUSDT");
    }

    #[test]
    fn test_fetch_requests_empty() {
        assert!(fetch_requests(&[], 5).is_empty());
    }

    // =========================================================================
    // Parallel VWAP Tests
    // =========================================================================

    #[tokio::test]
    async fn test_parallel_attachment_preserves_order() {
        let market = MarketData::new()
            .with_candles("BTCUSDT", Exchange::Binance, flat_candles(dec!(100), -10, 10))
            .with_candles("BTCUSDT", Exchange::Bybit, flat_candles(dec!(50), -10, 10))
            .with_candles("ETHUSDT", Exchange::Binance, flat_candles(dec!(3), -10, 10))
            .with_candles("ETHUSDT", Exchange::Bybit, flat_candles(dec!(4), -10, 10));

        let mut opps = vec![
            opp("ETHUSDT", T0),
            opp("BTCUSDT", T0),
            opp("XRPUSDT", T0),
            opp("ETHUSDT", T0 + MINUTE_MS),
        ];

        let stats =
            attach_vwaps_parallel(VwapCalculator::new(5, 3), &mut opps, Arc::new(market), 2).await;

        assert_eq!(stats.total, 4);
        assert_eq!(stats.priced, 3);
        assert_eq!(opps[0].vwap_entry_binance(), Some(dec!(3)));
        assert_eq!(opps[1].vwap_entry_binance(), Some(dec!(100)));
        assert!(!opps[2].is_price_valid());
        assert_eq!(opps[3].vwap_exit_bybit(), Some(dec!(4)));
    }

    #[tokio::test]
    async fn test_parallel_matches_sequential() {
        let market = MarketData::new()
            .with_candles("BTCUSDT", Exchange::Binance, flat_candles(dec!(100), -10, 10))
            .with_candles("BTCUSDT", Exchange::Bybit, flat_candles(dec!(50), -3, 10));
        let base = vec![opp("BTCUSDT", T0), opp("BTCUSDT", T0 + 8 * MINUTE_MS)];
        let calc = VwapCalculator::new(5, 3);

        let mut sequential = base.clone();
        crate::backtest::vwap::attach_vwaps(&calc, &mut sequential, &market);

        let mut parallel = base;
        attach_vwaps_parallel(calc, &mut parallel, Arc::new(market), 4).await;

        assert_eq!(sequential, parallel);
    }

    // =========================================================================
    // Pipeline Tests
    // =========================================================================

    #[tokio::test]
    async fn test_run_with_offline_cache() {
        let runner = BacktestRunner::new(Config::default()).offline(true);
        let source = TimelineLoader::from_rows(vec![row("BTCUSDT"), row("ETHUSDT")]);

        let report = runner.run_with(&source, &offline_fetcher()).await.unwrap();

        assert_eq!(report.loader.opportunities, 2);
        assert_eq!(report.vwap.priced, 1);
        assert_eq!(report.unpriceable_symbols, vec!["ETHUSDT"]);

        let result = &report.result;
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.failed_trades, 1);
        assert_eq!(result.skipped.get(&SkipReason::PriceUnavailable), Some(&1));

        // Flat prices: position 25000, funding 25, fees 40
        assert_eq!(result.trades[0].net_pnl, dec!(-15));
        assert_eq!(result.final_portfolio_value, dec!(99985));
    }

    #[tokio::test]
    async fn test_run_counts_invalid_pay_flags_as_skipped() {
        let runner = BacktestRunner::new(Config::default()).offline(true);
        let mut both_pay = row("ETHUSDT");
        both_pay.bybit_pays = true;
        let source = TimelineLoader::from_rows(vec![row("BTCUSDT"), both_pay]);

        let cache = CandleCache::new(":memory:").unwrap();
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            cache
                .insert_candles(symbol, Exchange::Binance, &flat_candles(dec!(100), -10, 10))
                .unwrap();
            cache
                .insert_candles(symbol, Exchange::Bybit, &flat_candles(dec!(50), -10, 10))
                .unwrap();
        }
        let fetcher = CandleFetcher::new(cache, RetryConfig::default(), 2).offline(true);

        let report = runner.run_with(&source, &fetcher).await.unwrap();

        assert_eq!(report.loader.rule_violations, 1);
        assert_eq!(report.loader.opportunities, 2);

        let result = &report.result;
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.failed_trades, 1);
        assert_eq!(result.skipped.get(&SkipReason::InvalidDirection), Some(&1));
        assert_eq!(result.trades[0].symbol, "BTCUSDT");
        assert_eq!(result.trades[0].capital_allocated, dec!(50000));
    }

    #[tokio::test]
    async fn test_run_with_no_opportunities() {
        let runner = BacktestRunner::new(Config::default());
        let mut outside = row("BTCUSDT");
        outside.timestamp = 0;
        let source = TimelineLoader::from_rows(vec![outside]);

        let report = runner.run_with(&source, &offline_fetcher()).await.unwrap();

        assert!(!report.result.has_trades());
        assert_eq!(report.loader.out_of_range, 1);
    }

    #[tokio::test]
    async fn test_save_reports() {
        let dir = std::env::temp_dir().join(format!("fia-reports-{}", std::process::id()));
        let mut config = Config::default();
        config.output.output_dir = dir.to_string_lossy().to_string();
        config.output.save_equity_curve = false;

        let runner = BacktestRunner::new(config).offline(true);
        let source = TimelineLoader::from_rows(vec![row("BTCUSDT")]);
        let report = runner.run_with(&source, &offline_fetcher()).await.unwrap();

        let written = runner.save_reports(&report).unwrap();

        assert_eq!(written.len(), 2);
        assert!(dir.join("trades.csv").exists());
        assert!(!dir.join("equity_curve.csv").exists());

        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["result"]["total_trades"], 1);
        assert_eq!(summary["loader"]["opportunities"], 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
