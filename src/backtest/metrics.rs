//! Performance metrics calculation for backtesting.
//!
//! Trade statistics, Sharpe and Sortino ratios, drawdown analysis and
//! per-direction / per-symbol breakdowns.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::engine::{EquityPoint, TradeRecord};
use crate::utils::decimal::{from_f64, percent_of, safe_div, to_f64};

/// Trading days per year used to scale per-trade ratios.
const ANNUALIZATION_PERIODS: f64 = 252.0;

/// Cap applied to Sortino when there is no downside.
const SORTINO_CAP: Decimal = dec!(100);

const MS_PER_HOUR: i64 = 3_600_000;

/// Count and P&L for one slice of the trade log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub trades: u64,
    pub winning_trades: u64,
    pub net_pnl: Decimal,
}

impl GroupStats {
    fn record(&mut self, net_pnl: Decimal) {
        self.trades += 1;
        if net_pnl > Decimal::ZERO {
            self.winning_trades += 1;
        }
        self.net_pnl += net_pnl;
    }

    pub fn win_rate(&self) -> Decimal {
        percent_of(Decimal::from(self.winning_trades), Decimal::from(self.trades))
    }
}

/// Comprehensive backtest performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Activity
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    /// Winning trades / total, as percentage
    pub win_rate: Decimal,

    // P&L
    pub total_pnl: Decimal,
    pub avg_pnl: Decimal,
    /// Largest single net P&L
    pub max_win: Decimal,
    /// Smallest single net P&L
    pub max_loss: Decimal,
    pub total_price_pnl: Decimal,
    pub total_funding_pnl: Decimal,
    pub total_fees: Decimal,
    /// Total P&L over initial capital, as percentage
    pub return_pct: Decimal,

    // Risk
    /// Maximum drawdown of portfolio value, as percentage
    pub max_drawdown_pct: Decimal,
    /// Longest time spent below a prior peak, in hours
    pub max_drawdown_duration_hours: i64,
    /// Per-trade Sharpe ratio scaled by sqrt(252)
    pub sharpe_ratio: Decimal,
    /// Per-trade Sortino ratio scaled by sqrt(252)
    pub sortino_ratio: Decimal,
    /// Gross wins / gross losses; `None` when there are no losing trades
    pub profit_factor: Option<Decimal>,

    // Time
    /// Span between first and last trade in days
    pub duration_days: f64,

    // Breakdowns
    pub by_direction: BTreeMap<String, GroupStats>,
    pub by_symbol: BTreeMap<String, GroupStats>,
}

impl BacktestMetrics {
    /// Calculate metrics from the trade log and equity curve.
    pub fn calculate(
        trades: &[TradeRecord],
        equity_curve: &[EquityPoint],
        initial_capital: Decimal,
    ) -> Self {
        if trades.is_empty() {
            return Self::empty();
        }

        let pnl: Vec<Decimal> = trades.iter().map(|t| t.net_pnl).collect();
        let total_trades = trades.len() as u64;

        let winning_trades = pnl.iter().filter(|p| **p > Decimal::ZERO).count() as u64;
        let losing_trades = pnl.iter().filter(|p| **p < Decimal::ZERO).count() as u64;
        let win_rate = percent_of(Decimal::from(winning_trades), Decimal::from(total_trades));

        let total_pnl: Decimal = pnl.iter().sum();
        let avg_pnl = total_pnl / Decimal::from(total_trades);
        let max_win = pnl.iter().copied().max().unwrap_or(Decimal::ZERO);
        let max_loss = pnl.iter().copied().min().unwrap_or(Decimal::ZERO);

        let mut by_direction: BTreeMap<String, GroupStats> = BTreeMap::new();
        let mut by_symbol: BTreeMap<String, GroupStats> = BTreeMap::new();
        for t in trades {
            by_direction
                .entry(t.direction.as_str().to_string())
                .or_default()
                .record(t.net_pnl);
            by_symbol.entry(t.symbol.clone()).or_default().record(t.net_pnl);
        }

        let (max_drawdown_pct, max_drawdown_duration_hours) =
            calculate_max_drawdown(equity_curve, initial_capital);

        let duration_days = match (equity_curve.first(), equity_curve.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp) as f64 / 86_400_000.0,
            _ => 0.0,
        };

        Self {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            total_pnl,
            avg_pnl,
            max_win,
            max_loss,
            total_price_pnl: trades.iter().map(|t| t.price_pnl).sum(),
            total_funding_pnl: trades.iter().map(|t| t.funding_pnl).sum(),
            total_fees: trades.iter().map(|t| t.total_fees).sum(),
            return_pct: percent_of(total_pnl, initial_capital),
            max_drawdown_pct,
            max_drawdown_duration_hours,
            sharpe_ratio: calculate_sharpe(&pnl),
            sortino_ratio: calculate_sortino(&pnl),
            profit_factor: calculate_profit_factor(&pnl),
            duration_days,
            by_direction,
            by_symbol,
        }
    }

    /// Metrics for a run without trades.
    pub fn empty() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            avg_pnl: Decimal::ZERO,
            max_win: Decimal::ZERO,
            max_loss: Decimal::ZERO,
            total_price_pnl: Decimal::ZERO,
            total_funding_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            return_pct: Decimal::ZERO,
            max_drawdown_pct: Decimal::ZERO,
            max_drawdown_duration_hours: 0,
            sharpe_ratio: Decimal::ZERO,
            sortino_ratio: Decimal::ZERO,
            profit_factor: None,
            duration_days: 0.0,
            by_direction: BTreeMap::new(),
            by_symbol: BTreeMap::new(),
        }
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        let profit_factor = match self.profit_factor {
            Some(pf) => format!("{:.2}", pf),
            None => "n/a (no losing trades)".to_string(),
        };

        let mut out = format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
RETURNS
  Total P&L:         ${:.2} ({:.4}%)
  Average P&L:       ${:.4}
  Max Win:           ${:.4}
  Max Loss:          ${:.4}

COMPONENTS
  Price P&L:         ${:.2}
  Funding P&L:       ${:.2}
  Fees:              ${:.2}

RISK
  Max Drawdown:      {:.4}%
  DD Duration:       {}h
  Sharpe Ratio:      {:.3}
  Sortino Ratio:     {:.3}
  Profit Factor:     {}

ACTIVITY
  Total Trades:      {}
  Winning:           {}
  Losing:            {}
  Win Rate:          {:.1}%
"#,
            self.duration_days,
            self.total_pnl,
            self.return_pct,
            self.avg_pnl,
            self.max_win,
            self.max_loss,
            self.total_price_pnl,
            self.total_funding_pnl,
            self.total_fees,
            self.max_drawdown_pct,
            self.max_drawdown_duration_hours,
            self.sharpe_ratio,
            self.sortino_ratio,
            profit_factor,
            self.total_trades,
            self.winning_trades,
            self.losing_trades,
            self.win_rate,
        );

        if !self.by_direction.is_empty() {
            out.push_str("\nBY DIRECTION\n");
            for (direction, stats) in &self.by_direction {
                out.push_str(&format!(
                    "  {:<26} {:>6} trades  ${:>12.2}  ({:.1}% win)\n",
                    direction,
                    stats.trades,
                    stats.net_pnl,
                    stats.win_rate()
                ));
            }
        }

        out.push_str("═══════════════════════════════════════════════");
        out
    }

    /// Symbols ranked by net P&L, best first.
    pub fn top_symbols(&self, n: usize) -> Vec<(&str, &GroupStats)> {
        let mut ranked: Vec<(&str, &GroupStats)> = self
            .by_symbol
            .iter()
            .map(|(s, g)| (s.as_str(), g))
            .collect();
        ranked.sort_by(|a, b| b.1.net_pnl.cmp(&a.1.net_pnl).then(a.0.cmp(b.0)));
        ranked.truncate(n);
        ranked
    }
}

/// Maximum drawdown percentage and longest underwater span in hours.
///
/// The running peak starts at `initial_capital` rather than at the first
/// curve point, so a losing first trade already counts as drawdown.
fn calculate_max_drawdown(equity_curve: &[EquityPoint], initial_capital: Decimal) -> (Decimal, i64) {
    let Some(first) = equity_curve.first() else {
        return (Decimal::ZERO, 0);
    };

    let mut peak = initial_capital;
    let mut peak_ts = first.timestamp;
    let mut max_dd = Decimal::ZERO;
    let mut max_duration_ms: i64 = 0;
    let mut underwater = false;

    for point in equity_curve {
        if point.portfolio_value >= peak {
            if underwater {
                max_duration_ms = max_duration_ms.max(point.timestamp - peak_ts);
                underwater = false;
            }
            peak = point.portfolio_value;
            peak_ts = point.timestamp;
        } else {
            underwater = true;
            let dd = percent_of(peak - point.portfolio_value, peak);
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    if underwater {
        if let Some(last) = equity_curve.last() {
            max_duration_ms = max_duration_ms.max(last.timestamp - peak_ts);
        }
    }

    (max_dd, max_duration_ms / MS_PER_HOUR)
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Sharpe ratio over per-trade net P&L (zero risk-free rate).
fn calculate_sharpe(pnl: &[Decimal]) -> Decimal {
    if pnl.len() < 2 {
        return Decimal::ZERO;
    }

    let values: Vec<f64> = pnl.iter().map(|p| to_f64(*p)).collect();
    let (mean, std_dev) = mean_and_std(&values);

    if std_dev < 1e-10 {
        return Decimal::ZERO;
    }

    from_f64(mean / std_dev * ANNUALIZATION_PERIODS.sqrt())
}

/// Sortino ratio using the deviation of losing trades only.
fn calculate_sortino(pnl: &[Decimal]) -> Decimal {
    if pnl.len() < 2 {
        return Decimal::ZERO;
    }

    let values: Vec<f64> = pnl.iter().map(|p| to_f64(*p)).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    let downside: Vec<f64> = values.iter().copied().filter(|v| *v < 0.0).collect();
    if downside.is_empty() {
        return if mean > 0.0 { SORTINO_CAP } else { Decimal::ZERO };
    }

    let downside_deviation =
        (downside.iter().map(|v| v.powi(2)).sum::<f64>() / downside.len() as f64).sqrt();

    if downside_deviation < 1e-10 {
        return SORTINO_CAP;
    }

    from_f64(mean / downside_deviation * ANNUALIZATION_PERIODS.sqrt())
}

/// Gross wins over gross losses.
fn calculate_profit_factor(pnl: &[Decimal]) -> Option<Decimal> {
    let wins: Decimal = pnl.iter().filter(|p| **p > Decimal::ZERO).sum();
    let losses: Decimal = pnl.iter().filter(|p| **p < Decimal::ZERO).map(|p| p.abs()).sum();

    if losses.is_zero() {
        None
    } else {
        Some(safe_div(wins, losses))
    }
}
