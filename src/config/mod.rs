//! Configuration management for the backtester.
//!
//! Loads settings from an optional config file and `FIA__`-prefixed
//! environment variables, falling back to defaults for every field.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{FeeSchedule, VwapCalculator};
use crate::utils::RetryConfig;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Analysis period
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Capital and VWAP parameters
    #[serde(default)]
    pub trading: TradingConfig,
    /// Exchange fee schedule
    #[serde(default)]
    pub fees: FeesConfig,
    /// Symbol universe filters
    #[serde(default)]
    pub symbols: SymbolsConfig,
    /// Input locations
    #[serde(default)]
    pub data: DataConfig,
    /// Kline download behaviour
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Report outputs
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// First day of the analysis period (YYYY-MM-DD, UTC)
    #[serde(default = "default_start_date")]
    pub start_date: String,
    /// Last day of the analysis period, inclusive
    #[serde(default = "default_end_date")]
    pub end_date: String,
    /// Concurrent per-symbol VWAP tasks
    #[serde(default = "default_vwap_parallelism")]
    pub vwap_parallelism: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Capital split across opportunities sharing a timestamp
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// VWAP lookback/lookahead window
    #[serde(default = "default_vwap_window")]
    pub vwap_window_minutes: u32,
    /// Minimum candles inside a window for a usable VWAP
    #[serde(default = "default_min_candles")]
    pub min_candles: usize,
    /// Reported only; not applied to fills
    #[serde(default = "default_buffer_pct")]
    pub entry_buffer_pct: Decimal,
    #[serde(default = "default_buffer_pct")]
    pub exit_buffer_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeesConfig {
    #[serde(default = "default_maker_fee")]
    pub maker_fee: Decimal,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolsConfig {
    /// Ignore the whitelist and keep every symbol in the timeline
    #[serde(default = "default_true")]
    pub include_all: bool,
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Always dropped, even when whitelisted
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Timeline CSV file, or a directory of `funding_rate_timeline_*.csv`
    #[serde(default = "default_timeline_path")]
    pub timeline_path: String,
    /// SQLite kline cache
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// In-flight kline requests per exchange
    #[serde(default = "default_concurrency")]
    pub concurrency_per_exchange: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_binance_url")]
    pub binance_base_url: String,
    #[serde(default = "default_bybit_url")]
    pub bybit_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_true")]
    pub save_detailed_trades: bool,
    #[serde(default = "default_true")]
    pub save_equity_curve: bool,
    #[serde(default = "default_true")]
    pub save_summary_json: bool,
}

// Default value functions
fn default_start_date() -> String {
    "2025-08-07".to_string()
}

fn default_end_date() -> String {
    "2025-10-07".to_string()
}

fn default_vwap_parallelism() -> usize {
    8
}

fn default_initial_capital() -> Decimal {
    Decimal::new(100_000, 0) // 100k USDT
}

fn default_vwap_window() -> u32 {
    5
}

fn default_min_candles() -> usize {
    3
}

fn default_buffer_pct() -> Decimal {
    Decimal::new(5, 4) // 0.0005 (0.05%)
}

fn default_maker_fee() -> Decimal {
    Decimal::new(2, 4) // 0.0002 (0.02%)
}

fn default_taker_fee() -> Decimal {
    Decimal::new(4, 4) // 0.0004 (0.04%)
}

fn default_true() -> bool {
    true
}

fn default_timeline_path() -> String {
    "data/timelines".to_string()
}

fn default_cache_path() -> String {
    "data/kline_cache.db".to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    2000
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_binance_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_bybit_url() -> String {
    "https://api.bybit.com".to_string()
}

fn default_output_dir() -> String {
    "results/backtest".to_string()
}

impl Config {
    /// Load configuration from an optional file and environment variables.
    ///
    /// Without an explicit path a `config.{toml,yaml,json}` in the working
    /// directory is used if present. Environment variables win, e.g.
    /// `FIA__TRADING__INITIAL_CAPITAL=50000`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(p) => config::File::with_name(p).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("FIA").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.trading.initial_capital > Decimal::ZERO,
            "initial_capital must be positive"
        );

        anyhow::ensure!(
            self.trading.vwap_window_minutes > 0,
            "vwap_window_minutes must be positive"
        );

        anyhow::ensure!(self.trading.min_candles >= 1, "min_candles must be >= 1");

        for (name, fee) in [
            ("maker_fee", self.fees.maker_fee),
            ("taker_fee", self.fees.taker_fee),
        ] {
            anyhow::ensure!(
                fee >= Decimal::ZERO && fee <= Decimal::ONE,
                "{} must be between 0 and 1",
                name
            );
        }

        let (start, end) = self.time_range_ms()?;
        anyhow::ensure!(start < end, "start_date must be before end_date");

        anyhow::ensure!(
            self.fetch.concurrency_per_exchange >= 1,
            "concurrency_per_exchange must be >= 1"
        );

        anyhow::ensure!(
            self.analysis.vwap_parallelism >= 1,
            "vwap_parallelism must be >= 1"
        );

        anyhow::ensure!(
            self.symbols.include_all || !self.symbols.whitelist.is_empty(),
            "whitelist must not be empty when include_all is false"
        );

        Ok(())
    }

    /// Settings that are legal but probably a mistake.
    pub fn consistency_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.trading.initial_capital > Decimal::new(1_000_000, 0) {
            warnings.push(format!(
                "initial_capital {} is unusually large",
                self.trading.initial_capital
            ));
        }

        if self.trading.vwap_window_minutes > 120 {
            warnings.push(format!(
                "vwap_window_minutes {} exceeds two hours",
                self.trading.vwap_window_minutes
            ));
        }

        let one_pct = Decimal::new(1, 2);
        if self.fees.maker_fee > one_pct || self.fees.taker_fee > one_pct {
            warnings.push("fee above 1% per fill".to_string());
        }

        if self.fees.taker_fee < self.fees.maker_fee {
            warnings.push("taker_fee is lower than maker_fee".to_string());
        }

        if let Ok((start, end)) = self.time_range_ms() {
            let days = (end - start + 1) / 86_400_000;
            if days < 1 {
                warnings.push("analysis range is shorter than one day".to_string());
            } else if days > 365 {
                warnings.push(format!("analysis range spans {} days", days));
            }
        }

        warnings
    }

    /// Analysis period as `[start 00:00:00.000, end 23:59:59.999]` UTC millis.
    pub fn time_range_ms(&self) -> Result<(i64, i64)> {
        let start = parse_date(&self.analysis.start_date, "start_date")?;
        let end = parse_date(&self.analysis.end_date, "end_date")?;

        let start_ms = start
            .and_hms_opt(0, 0, 0)
            .context("Invalid start time")?
            .and_utc()
            .timestamp_millis();
        let end_ms = (end + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .context("Invalid end time")?
            .and_utc()
            .timestamp_millis()
            - 1;

        Ok((start_ms, end_ms))
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            maker_fee: self.fees.maker_fee,
            taker_fee: self.fees.taker_fee,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.fetch.max_retries,
            initial_delay_ms: self.fetch.initial_backoff_ms,
            max_delay_ms: self.fetch.max_backoff_ms,
        }
    }

    pub fn vwap_calculator(&self) -> VwapCalculator {
        VwapCalculator::new(self.trading.vwap_window_minutes, self.trading.min_candles)
    }
}

fn parse_date(value: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .with_context(|| format!("{} must be YYYY-MM-DD, got '{}'", field, value))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            trading: TradingConfig::default(),
            fees: FeesConfig::default(),
            symbols: SymbolsConfig::default(),
            data: DataConfig::default(),
            fetch: FetchConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            start_date: default_start_date(),
            end_date: default_end_date(),
            vwap_parallelism: default_vwap_parallelism(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            vwap_window_minutes: default_vwap_window(),
            min_candles: default_min_candles(),
            entry_buffer_pct: default_buffer_pct(),
            exit_buffer_pct: default_buffer_pct(),
        }
    }
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            maker_fee: default_maker_fee(),
            taker_fee: default_taker_fee(),
        }
    }
}

impl Default for SymbolsConfig {
    fn default() -> Self {
        Self {
            include_all: true,
            whitelist: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            timeline_path: default_timeline_path(),
            cache_path: default_cache_path(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency_per_exchange: default_concurrency(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            request_timeout_secs: default_request_timeout(),
            binance_base_url: default_binance_url(),
            bybit_base_url: default_bybit_url(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            save_detailed_trades: true,
            save_equity_curve: true,
            save_summary_json: true,
        }
    }
}
