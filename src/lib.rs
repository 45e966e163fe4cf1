//! # Funding Interval Arb
//!
//! Backtesting for cross-exchange funding-rate arbitrage between Binance and
//! Bybit perpetuals whose funding intervals differ.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Kline clients (Binance, Bybit), cache-aware fetcher, kline validation
//! - `persistence`: SQLite candle cache
//! - `backtest`: Timeline loading, VWAP pricing, simulation, metrics and reports
//! - `utils`: Shared utilities, decimal helpers and retry/backoff

pub mod backtest;
pub mod config;
pub mod exchange;
pub mod persistence;
pub mod utils;

pub use config::Config;
