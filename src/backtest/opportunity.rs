//! Funding-mismatch opportunity model.
//!
//! An [`Opportunity`] is one tradable instant for one symbol. It is built
//! from a timeline record, has its four VWAP fill prices attached exactly
//! once, and is then read by the simulation engine without further change.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exchange::Exchange;

/// Per-opportunity validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpportunityError {
    /// Exactly one exchange must be paying funding.
    #[error("exactly one pay flag must be set (binance_pays={binance_pays}, bybit_pays={bybit_pays})")]
    InvalidPayFlags { binance_pays: bool, bybit_pays: bool },

    #[error("capital allocated must be positive, got {0}")]
    NonPositiveCapital(Decimal),

    #[error("symbol is empty")]
    MissingSymbol,

    #[error("timestamp must be positive, got {0}")]
    InvalidTimestamp(i64),

    #[error("duration must be positive, got {0} hours")]
    NonPositiveDuration(Decimal),

    /// VWAP prices can be attached only once.
    #[error("prices already attached to {symbol} at {timestamp}")]
    PricesAlreadyAttached { symbol: String, timestamp: i64 },
}

/// The four VWAP fill prices, any of which may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VwapQuotes {
    pub entry_binance: Option<Decimal>,
    pub entry_bybit: Option<Decimal>,
    pub exit_binance: Option<Decimal>,
    pub exit_bybit: Option<Decimal>,
}

impl VwapQuotes {
    /// All four prices present and strictly positive.
    pub fn leg_prices(&self) -> Option<LegPrices> {
        let positive = |p: Option<Decimal>| p.filter(|v| *v > Decimal::ZERO);

        Some(LegPrices {
            entry_binance: positive(self.entry_binance)?,
            entry_bybit: positive(self.entry_bybit)?,
            exit_binance: positive(self.exit_binance)?,
            exit_bybit: positive(self.exit_bybit)?,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.leg_prices().is_some()
    }

    /// Number of prices present.
    pub fn available_count(&self) -> usize {
        [
            self.entry_binance,
            self.entry_bybit,
            self.exit_binance,
            self.exit_bybit,
        ]
        .iter()
        .filter(|p| p.is_some())
        .count()
    }
}

/// Complete set of fill prices.
///
/// Built from attached VWAPs by [`VwapQuotes::leg_prices`], which only
/// succeeds when all four are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegPrices {
    pub entry_binance: Decimal,
    pub entry_bybit: Decimal,
    pub exit_binance: Decimal,
    pub exit_bybit: Decimal,
}

impl LegPrices {
    pub fn entry(&self, exchange: Exchange) -> Decimal {
        match exchange {
            Exchange::Binance => self.entry_binance,
            Exchange::Bybit => self.entry_bybit,
        }
    }

    pub fn exit(&self, exchange: Exchange) -> Decimal {
        match exchange {
            Exchange::Binance => self.exit_binance,
            Exchange::Bybit => self.exit_bybit,
        }
    }
}

/// One candidate arbitrage event.
#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    /// Event time in epoch milliseconds (UTC)
    pub timestamp: i64,
    pub symbol: String,
    /// Total notional for both legs
    pub capital_allocated: Decimal,
    /// Signed funding rate as a fraction; positive means longs pay
    pub binance_rate: Decimal,
    pub bybit_rate: Decimal,
    pub binance_pays: bool,
    pub bybit_pays: bool,
    /// Length of the mismatch window in hours
    pub duration_hours: Decimal,
    /// Free-form mismatch label from the timeline (e.g. "8h_vs_1h")
    pub mismatch_type: Option<String>,
    vwap: VwapQuotes,
    is_price_valid: bool,
    prices_attached: bool,
}

impl Opportunity {
    /// Create an opportunity without prices.
    ///
    /// Pay flags are not checked here; see [`Opportunity::validate`].
    pub fn new(
        timestamp: i64,
        symbol: impl Into<String>,
        capital_allocated: Decimal,
        binance_rate: Decimal,
        bybit_rate: Decimal,
        binance_pays: bool,
        bybit_pays: bool,
    ) -> Self {
        Self {
            timestamp,
            symbol: symbol.into(),
            capital_allocated,
            binance_rate,
            bybit_rate,
            binance_pays,
            bybit_pays,
            duration_hours: Decimal::ONE,
            mismatch_type: None,
            vwap: VwapQuotes::default(),
            is_price_valid: false,
            prices_attached: false,
        }
    }

    pub fn with_duration_hours(mut self, hours: Decimal) -> Self {
        self.duration_hours = hours;
        self
    }

    pub fn with_mismatch_type(mut self, mismatch_type: impl Into<String>) -> Self {
        self.mismatch_type = Some(mismatch_type.into());
        self
    }

    /// Check structural invariants of the record.
    pub fn validate(&self) -> Result<(), OpportunityError> {
        if self.symbol.trim().is_empty() {
            return Err(OpportunityError::MissingSymbol);
        }
        if self.timestamp <= 0 {
            return Err(OpportunityError::InvalidTimestamp(self.timestamp));
        }
        if self.binance_pays == self.bybit_pays {
            return Err(OpportunityError::InvalidPayFlags {
                binance_pays: self.binance_pays,
                bybit_pays: self.bybit_pays,
            });
        }
        if self.capital_allocated <= Decimal::ZERO {
            return Err(OpportunityError::NonPositiveCapital(self.capital_allocated));
        }
        if self.duration_hours <= Decimal::ZERO {
            return Err(OpportunityError::NonPositiveDuration(self.duration_hours));
        }
        Ok(())
    }

    /// Attach VWAP fill prices. Allowed once per opportunity.
    pub fn attach_vwaps(&mut self, quotes: VwapQuotes) -> Result<(), OpportunityError> {
        if self.prices_attached {
            return Err(OpportunityError::PricesAlreadyAttached {
                symbol: self.symbol.clone(),
                timestamp: self.timestamp,
            });
        }

        self.vwap = quotes;
        self.is_price_valid = quotes.is_complete();
        self.prices_attached = true;
        Ok(())
    }

    /// True only once all four VWAP values are present and positive.
    pub fn is_price_valid(&self) -> bool {
        self.is_price_valid
    }

    pub fn vwaps(&self) -> &VwapQuotes {
        &self.vwap
    }

    pub fn vwap_entry_binance(&self) -> Option<Decimal> {
        self.vwap.entry_binance
    }

    pub fn vwap_entry_bybit(&self) -> Option<Decimal> {
        self.vwap.entry_bybit
    }

    pub fn vwap_exit_binance(&self) -> Option<Decimal> {
        self.vwap.exit_binance
    }

    pub fn vwap_exit_bybit(&self) -> Option<Decimal> {
        self.vwap.exit_bybit
    }

    /// Fill prices, when valid.
    pub fn leg_prices(&self) -> Option<LegPrices> {
        if self.is_price_valid {
            self.vwap.leg_prices()
        } else {
            None
        }
    }

    /// Notional per leg: half the allocated capital.
    pub fn position_size(&self) -> Decimal {
        self.capital_allocated / Decimal::TWO
    }

    /// Funding rate on the given exchange.
    pub fn rate(&self, exchange: Exchange) -> Decimal {
        match exchange {
            Exchange::Binance => self.binance_rate,
            Exchange::Bybit => self.bybit_rate,
        }
    }

    /// Event time as a UTC datetime.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}
