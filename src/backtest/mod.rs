//! Backtesting of funding-interval mismatch trades.
//!
//! This module provides:
//! - Timeline loading (tradable mismatch windows from CSV)
//! - Direction resolution from the per-exchange payment flags
//! - VWAP entry/exit pricing from 1-minute candles
//! - A sequential simulation engine with an exact equity curve
//! - Performance metrics and report export
//!
//! # Example
//!
//! ```rust,ignore
//! use funding_interval_arb::backtest::BacktestRunner;
//! use funding_interval_arb::Config;
//!
//! let runner = BacktestRunner::new(Config::load(None)?);
//! let report = runner.run().await?;
//! println!("{}", report.result.summary());
//! runner.save_reports(&report)?;
//! ```

mod data;
mod direction;
mod engine;
mod metrics;
mod opportunity;
mod pnl;
mod runner;
mod vwap;

pub use data::{
    parse_bool, parse_timestamp, LoadedOpportunities, LoaderOptions, LoaderSummary,
    OpportunitySource, TimelineLoader, TimelineRow,
};
pub use direction::{resolve_direction, DirectionResolution, TradeDirection};
pub use engine::{BacktestResult, EquityPoint, SimulationEngine, SkipReason, TradeRecord};
pub use metrics::{BacktestMetrics, GroupStats};
pub use opportunity::{LegPrices, Opportunity, OpportunityError, VwapQuotes};
pub use pnl::{
    calculate_pnl, funding_pnl, leg_return, price_pnl, trading_fees, FeeSchedule, PnlBreakdown,
};
pub use runner::{attach_vwaps_parallel, fetch_requests, BacktestRunner, RunReport};
pub use vwap::{
    apply_quotes, attach_vwaps, calculate_vwap, UnavailableReason, VwapCalculator, VwapQuoteSet,
    VwapResult, VwapStats, VwapWindow, DEFAULT_MIN_CANDLES,
};
