//! Exchange integrations for historical market data.
//!
//! ## Binance / Bybit
//! Read-only public kline endpoints for one-minute candles:
//! - Paginated HTTP clients behind the [`KlineProvider`] trait
//! - Cache-aware concurrent fetcher with retry and backoff
//! - Data quality validation (coverage, gaps, anomalies)

mod binance;
mod bybit;
pub mod fetcher;
mod traits;
mod types;
pub mod validator;

pub use binance::BinanceKlineClient;
pub use bybit::BybitKlineClient;
pub use fetcher::{CandleFetcher, CandleSeries, FetchRequest, MarketData};
pub use traits::KlineProvider;
pub use types::*;
pub use validator::{validate_klines, KlineValidation};
