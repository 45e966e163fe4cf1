//! Backtesting simulation engine.
//!
//! Replays priced opportunities strictly in input order, one round trip
//! each, and accumulates realized P&L into an equity curve. Only
//! `cumulative_pnl` carries over between opportunities.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

use super::direction::TradeDirection;
use super::metrics::BacktestMetrics;
use super::opportunity::{LegPrices, Opportunity};
use super::pnl::{calculate_pnl, FeeSchedule, PnlBreakdown};
use crate::utils::decimal::percent_of;

/// Immutable record of one executed opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub symbol: String,
    pub direction: TradeDirection,
    pub capital_allocated: Decimal,
    /// Notional per leg
    pub position_size: Decimal,
    pub entry_binance: Decimal,
    pub entry_bybit: Decimal,
    pub exit_binance: Decimal,
    pub exit_bybit: Decimal,
    pub binance_rate: Decimal,
    pub bybit_rate: Decimal,
    pub price_pnl: Decimal,
    pub funding_pnl: Decimal,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub pnl_pct: Decimal,
}

impl TradeRecord {
    fn new(
        opportunity: &Opportunity,
        direction: TradeDirection,
        prices: &LegPrices,
        pnl: &PnlBreakdown,
    ) -> Self {
        Self {
            timestamp: opportunity.timestamp,
            symbol: opportunity.symbol.clone(),
            direction,
            capital_allocated: opportunity.capital_allocated,
            position_size: pnl.position_size,
            entry_binance: prices.entry_binance,
            entry_bybit: prices.entry_bybit,
            exit_binance: prices.exit_binance,
            exit_bybit: prices.exit_bybit,
            binance_rate: opportunity.binance_rate,
            bybit_rate: opportunity.bybit_rate,
            price_pnl: pnl.price_pnl,
            funding_pnl: pnl.funding_pnl,
            entry_fee: pnl.entry_fee,
            exit_fee: pnl.exit_fee,
            total_fees: pnl.total_fees(),
            net_pnl: pnl.net_pnl,
            pnl_pct: pnl.pnl_pct,
        }
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// A point on the equity curve, one per executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub cumulative_pnl: Decimal,
    /// Always `initial_capital + cumulative_pnl`
    pub portfolio_value: Decimal,
    pub trade_count: usize,
}

impl EquityPoint {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Why an opportunity was not traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// One or more VWAP prices missing or non-positive
    PriceUnavailable,
    NonPositiveCapital,
    /// Pay flags do not select exactly one exchange
    InvalidDirection,
}

/// Complete result of a backtest run.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub initial_capital: Decimal,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub final_pnl: Decimal,
    pub final_portfolio_value: Decimal,
    pub total_trades: usize,
    pub failed_trades: usize,
    /// `final_pnl / initial_capital * 100`
    pub return_pct: Decimal,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub metrics: BacktestMetrics,
}

impl BacktestResult {
    /// True when at least one opportunity was executed.
    pub fn has_trades(&self) -> bool {
        !self.trades.is_empty()
    }

    pub fn opportunities_processed(&self) -> usize {
        self.total_trades + self.failed_trades
    }

    /// Export the trade log to CSV.
    pub fn trades_to_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(
            file,
            "timestamp,symbol,direction,capital_allocated,position_size,\
             entry_binance,entry_bybit,exit_binance,exit_bybit,binance_rate,bybit_rate,\
             price_pnl,funding_pnl,entry_fee,exit_fee,total_fees,net_pnl,pnl_pct"
        )?;

        for t in &self.trades {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                format_ts(t.timestamp),
                t.symbol,
                t.direction,
                t.capital_allocated,
                t.position_size,
                t.entry_binance,
                t.entry_bybit,
                t.exit_binance,
                t.exit_bybit,
                t.binance_rate,
                t.bybit_rate,
                t.price_pnl,
                t.funding_pnl,
                t.entry_fee,
                t.exit_fee,
                t.total_fees,
                t.net_pnl,
                t.pnl_pct,
            )?;
        }

        Ok(())
    }

    /// Export the equity curve to CSV.
    pub fn equity_to_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(file, "timestamp,cumulative_pnl,portfolio_value,trade_count")?;

        for point in &self.equity_curve {
            writeln!(
                file,
                "{},{},{},{}",
                format_ts(point.timestamp),
                point.cumulative_pnl,
                point.portfolio_value,
                point.trade_count,
            )?;
        }

        Ok(())
    }

    /// Machine-readable run summary.
    pub fn summary_json(&self) -> serde_json::Value {
        json!({
            "has_trades": self.has_trades(),
            "initial_capital": self.initial_capital,
            "total_trades": self.total_trades,
            "failed_trades": self.failed_trades,
            "final_pnl": self.final_pnl,
            "final_portfolio_value": self.final_portfolio_value,
            "return_pct": self.return_pct,
            "skipped": self.skipped,
            "metrics": self.metrics,
            "first_trade": self.trades.first().map(|t| format_ts(t.timestamp)),
            "last_trade": self.trades.last().map(|t| format_ts(t.timestamp)),
        })
    }

    /// Write [`Self::summary_json`] to a file.
    pub fn write_summary_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let body = serde_json::to_string_pretty(&self.summary_json())?;
        std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        if !self.has_trades() {
            return self.no_trades_summary();
        }

        let period = match (self.trades.first(), self.trades.last()) {
            (Some(first), Some(last)) => format!(
                "{} to {}",
                format_date(first.timestamp),
                format_date(last.timestamp)
            ),
            _ => "n/a".to_string(),
        };

        format!(
            "{}\n\nBacktest Period: {}\nExecuted: {}\nSkipped: {}\nFinal Portfolio: ${:.2}",
            self.metrics.summary(),
            period,
            self.total_trades,
            self.failed_trades,
            self.final_portfolio_value,
        )
    }

    fn no_trades_summary(&self) -> String {
        let mut out = String::from(
            "═══════════════════════════════════════════════\n\
             NO TRADES EXECUTED\n\
             ═══════════════════════════════════════════════\n",
        );
        out.push_str(&format!(
            "  Opportunities:     {}\n  Skipped:           {}\n",
            self.opportunities_processed(),
            self.failed_trades
        ));
        for (reason, count) in &self.skipped {
            out.push_str(&format!("    {:<20} {}\n", format!("{:?}", reason), count));
        }
        out.push_str(&format!(
            "  Return:            {:.2}%\n═══════════════════════════════════════════════",
            self.return_pct
        ));
        out
    }
}

fn format_ts(timestamp: i64) -> String {
    DateTime::from_timestamp_millis(timestamp)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}

fn format_date(timestamp: i64) -> String {
    DateTime::from_timestamp_millis(timestamp)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// The backtesting simulation engine.
pub struct SimulationEngine {
    initial_capital: Decimal,
    fees: FeeSchedule,

    cumulative_pnl: Decimal,
    trades: Vec<TradeRecord>,
    equity_curve: Vec<EquityPoint>,
    skipped: BTreeMap<SkipReason, usize>,
}

impl SimulationEngine {
    /// Create a new engine.
    pub fn new(initial_capital: Decimal, fees: FeeSchedule) -> Self {
        Self {
            initial_capital,
            fees,
            cumulative_pnl: Decimal::ZERO,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            skipped: BTreeMap::new(),
        }
    }

    fn reset(&mut self) {
        self.cumulative_pnl = Decimal::ZERO;
        self.trades.clear();
        self.equity_curve.clear();
        self.skipped.clear();
    }

    /// Run every opportunity in order and return the result.
    ///
    /// State is reset first, so repeated runs on the same input are identical.
    pub fn run(&mut self, opportunities: &[Opportunity]) -> BacktestResult {
        self.reset();
        info!(
            "Starting simulation: {} opportunities, initial capital ${:.2}",
            opportunities.len(),
            self.initial_capital
        );

        let mut last_ts: Option<i64> = None;
        for (i, opp) in opportunities.iter().enumerate() {
            if last_ts.is_some_and(|t| opp.timestamp < t) {
                warn!(
                    symbol = %opp.symbol,
                    timestamp = opp.timestamp,
                    "Opportunity out of chronological order"
                );
            }
            last_ts = Some(opp.timestamp);

            if let Err(reason) = self.step(opp) {
                *self.skipped.entry(reason).or_default() += 1;
            }

            // Progress logging
            if i % 100 == 0 {
                debug!(
                    "Progress: {}/{} ({:.1}%), Cumulative P&L: ${:.2}",
                    i,
                    opportunities.len(),
                    (i as f64 / opportunities.len() as f64) * 100.0,
                    self.cumulative_pnl
                );
            }
        }

        let result = self.result();
        info!(
            "Simulation complete: {} executed, {} skipped, return {:.4}%",
            result.total_trades, result.failed_trades, result.return_pct
        );
        result
    }

    /// Process one opportunity.
    fn step(&mut self, opp: &Opportunity) -> std::result::Result<(), SkipReason> {
        let Some(prices) = opp.leg_prices() else {
            debug!(symbol = %opp.symbol, timestamp = opp.timestamp, "VWAP unavailable, skipping");
            return Err(SkipReason::PriceUnavailable);
        };

        if opp.capital_allocated <= Decimal::ZERO {
            warn!(
                symbol = %opp.symbol,
                timestamp = opp.timestamp,
                capital = %opp.capital_allocated,
                "Non-positive capital, skipping"
            );
            return Err(SkipReason::NonPositiveCapital);
        }

        let resolution = opp.direction().map_err(|e| {
            warn!(symbol = %opp.symbol, timestamp = opp.timestamp, error = %e, "Invalid opportunity");
            SkipReason::InvalidDirection
        })?;

        let pnl = calculate_pnl(
            resolution.direction,
            &prices,
            opp.binance_rate,
            opp.bybit_rate,
            opp.position_size(),
            &self.fees,
        );

        self.trades
            .push(TradeRecord::new(opp, resolution.direction, &prices, &pnl));
        self.cumulative_pnl += pnl.net_pnl;
        self.equity_curve.push(EquityPoint {
            timestamp: opp.timestamp,
            cumulative_pnl: self.cumulative_pnl,
            portfolio_value: self.portfolio_value(),
            trade_count: self.trades.len(),
        });

        Ok(())
    }

    /// Current portfolio value.
    pub fn portfolio_value(&self) -> Decimal {
        self.initial_capital + self.cumulative_pnl
    }

    pub fn cumulative_pnl(&self) -> Decimal {
        self.cumulative_pnl
    }

    /// Get the current equity curve.
    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    fn result(&self) -> BacktestResult {
        let metrics =
            BacktestMetrics::calculate(&self.trades, &self.equity_curve, self.initial_capital);

        BacktestResult {
            initial_capital: self.initial_capital,
            trades: self.trades.clone(),
            equity_curve: self.equity_curve.clone(),
            final_pnl: self.cumulative_pnl,
            final_portfolio_value: self.portfolio_value(),
            total_trades: self.trades.len(),
            failed_trades: self.skipped.values().sum(),
            return_pct: percent_of(self.cumulative_pnl, self.initial_capital),
            skipped: self.skipped.clone(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::opportunity::VwapQuotes;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn fees() -> FeeSchedule {
        FeeSchedule {
            maker_fee: dec!(0.0002),
            taker_fee: dec!(0.0004),
        }
    }

    fn quotes() -> VwapQuotes {
        VwapQuotes {
            entry_binance: Some(dec!(100)),
            entry_bybit: Some(dec!(50)),
            exit_binance: Some(dec!(101)),
            exit_bybit: Some(dec!(49.5)),
        }
    }

    fn priced(timestamp: i64, symbol: &str, quotes: VwapQuotes) -> Opportunity {
        let mut opp = Opportunity::new(
            timestamp,
            symbol,
            dec!(10000),
            dec!(-0.001),
            dec!(0.0003),
            true,
            false,
        );
        opp.attach_vwaps(quotes).unwrap();
        opp
    }

    fn engine() -> SimulationEngine {
        SimulationEngine::new(dec!(100000), fees())
    }

    // =========================================================================
    // Trade Execution Tests
    // =========================================================================

    #[test]
    fn test_reference_trade() {
        let result = engine().run(&[priced(1000, "BTCUSDT", quotes())]);

        assert_eq!(result.total_trades, 1);
        assert_eq!(result.failed_trades, 0);

        let trade = &result.trades[0];
        assert_eq!(trade.direction, TradeDirection::LongBinanceShortBybit);
        assert_eq!(trade.position_size, dec!(5000));
        assert_eq!(trade.price_pnl, dec!(100));
        assert_eq!(trade.funding_pnl, dec!(5));
        assert_eq!(trade.total_fees, dec!(8));
        assert_eq!(trade.net_pnl, dec!(97));

        assert_eq!(result.final_pnl, dec!(97));
        assert_eq!(result.final_portfolio_value, dec!(100097));
        assert_eq!(result.return_pct, dec!(0.097));
        assert_eq!(
            result.equity_curve,
            vec![EquityPoint {
                timestamp: 1000,
                cumulative_pnl: dec!(97),
                portfolio_value: dec!(100097),
                trade_count: 1,
            }]
        );
    }

    #[test]
    fn test_missing_vwap_skipped() {
        let missing = VwapQuotes {
            entry_bybit: None,
            ..quotes()
        };
        let result = engine().run(&[priced(1000, "BTCUSDT", missing)]);

        assert_eq!(result.total_trades, 0);
        assert_eq!(result.failed_trades, 1);
        assert!(result.trades.is_empty());
        assert!(result.equity_curve.is_empty());
        assert_eq!(result.skipped.get(&SkipReason::PriceUnavailable), Some(&1));
    }

    #[test]
    fn test_unpriced_opportunity_skipped() {
        let opp = Opportunity::new(1, "BTCUSDT", dec!(1), dec!(0), dec!(0), true, false);
        let result = engine().run(&[opp]);
        assert_eq!(result.failed_trades, 1);
    }

    #[test]
    fn test_both_pay_flags_skipped_not_fatal() {
        let mut bad = priced(1000, "BADUSDT", quotes());
        bad.bybit_pays = true;
        let good = priced(2000, "BTCUSDT", quotes());

        let result = engine().run(&[bad, good]);

        assert_eq!(result.total_trades, 1);
        assert_eq!(result.failed_trades, 1);
        assert_eq!(result.skipped.get(&SkipReason::InvalidDirection), Some(&1));
        assert_eq!(result.trades[0].symbol, "BTCUSDT");
    }

    #[test]
    fn test_non_positive_capital_skipped() {
        let mut opp = priced(1000, "BTCUSDT", quotes());
        opp.capital_allocated = Decimal::ZERO;

        let result = engine().run(&[opp]);
        assert_eq!(result.skipped.get(&SkipReason::NonPositiveCapital), Some(&1));
    }

    // =========================================================================
    // Equity Curve Tests
    // =========================================================================

    fn mixed_run() -> Vec<Opportunity> {
        let losing = VwapQuotes {
            exit_binance: Some(dec!(97)),
            ..quotes()
        };
        vec![
            priced(1000, "BTCUSDT", quotes()),
            priced(2000, "ETHUSDT", losing),
            priced(
                3000,
                "XRPUSDT",
                VwapQuotes {
                    exit_bybit: None,
                    ..quotes()
                },
            ),
            priced(4000, "BTCUSDT", quotes()),
        ]
    }

    #[test]
    fn test_equity_invariant() {
        let result = engine().run(&mixed_run());

        for point in &result.equity_curve {
            assert_eq!(point.portfolio_value, dec!(100000) + point.cumulative_pnl);
        }
        assert_eq!(
            result.final_pnl,
            result.trades.iter().map(|t| t.net_pnl).sum::<Decimal>()
        );
    }

    #[test]
    fn test_trade_count_monotonic() {
        let result = engine().run(&mixed_run());

        let counts: Vec<usize> = result.equity_curve.iter().map(|p| p.trade_count).collect();
        assert_eq!(counts, vec![1, 2, 3]);
        assert_eq!(result.failed_trades, 1);
    }

    #[test]
    fn test_equity_preserves_input_order() {
        let result = engine().run(&mixed_run());
        let ts: Vec<i64> = result.equity_curve.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![1000, 2000, 4000]);
    }

    #[test]
    fn test_run_is_deterministic() {
        let opps = mixed_run();
        let mut e = engine();

        let first = e.run(&opps);
        let second = e.run(&opps);

        assert_eq!(first.trades, second.trades);
        assert_eq!(first.equity_curve, second.equity_curve);
        assert_eq!(first.final_pnl, second.final_pnl);
    }

    // =========================================================================
    // BacktestResult Tests
    // =========================================================================

    #[test]
    fn test_no_trades_result() {
        let result = engine().run(&[]);

        assert!(!result.has_trades());
        assert_eq!(result.return_pct, Decimal::ZERO);
        assert_eq!(result.final_portfolio_value, dec!(100000));
        assert!(result.summary().contains("NO TRADES EXECUTED"));
    }

    #[test]
    fn test_summary_with_trades() {
        let result = engine().run(&mixed_run());
        let summary = result.summary();

        assert!(summary.contains("Backtest Period"));
        assert!(summary.contains("Executed: 3"));
        assert!(summary.contains("Skipped: 1"));
    }

    #[test]
    fn test_summary_json() {
        let result = engine().run(&[priced(1000, "BTCUSDT", quotes())]);
        let json = result.summary_json();

        assert_eq!(json["total_trades"], 1);
        assert_eq!(json["has_trades"], true);
        let final_pnl: Decimal = json["final_pnl"].as_str().unwrap().parse().unwrap();
        assert_eq!(final_pnl, dec!(97));
    }

    #[test]
    fn test_csv_exports() {
        let dir = std::env::temp_dir().join(format!("fia-engine-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let result = engine().run(&mixed_run());
        result.trades_to_csv(dir.join("trades.csv")).unwrap();
        result.equity_to_csv(dir.join("equity_curve.csv")).unwrap();

        let trades = std::fs::read_to_string(dir.join("trades.csv")).unwrap();
        assert_eq!(trades.lines().count(), 4);
        assert!(trades.lines().nth(1).unwrap().contains("LONG_BINANCE_SHORT_BYBIT"));

        let equity = std::fs::read_to_string(dir.join("equity_curve.csv")).unwrap();
        assert!(equity.starts_with("timestamp,cumulative_pnl,portfolio_value,trade_count"));
        let first = equity.lines().nth(1).unwrap();
        assert!(first.starts_with("1970-01-01T00:00:01+00:00,"));
        assert!(first.ends_with(",1"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
