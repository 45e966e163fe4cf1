//! Trade direction selection.
//!
//! The exchange that pays funding at the event and the sign of its rate pick
//! one of four hedged directions. The long leg is always on the exchange
//! whose funding is received; the short leg hedges price risk on the other.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::opportunity::{Opportunity, OpportunityError};
use crate::exchange::Exchange;

/// One of the four hedged trade directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeDirection {
    LongBybitShortBinance,
    ShortBybitLongBinance,
    LongBinanceShortBybit,
    ShortBinanceLongBybit,
}

impl TradeDirection {
    pub const ALL: [TradeDirection; 4] = [
        TradeDirection::LongBybitShortBinance,
        TradeDirection::ShortBybitLongBinance,
        TradeDirection::LongBinanceShortBybit,
        TradeDirection::ShortBinanceLongBybit,
    ];

    /// Exchange holding the long leg.
    pub fn long_exchange(&self) -> Exchange {
        match self {
            TradeDirection::LongBybitShortBinance => Exchange::Bybit,
            TradeDirection::ShortBybitLongBinance => Exchange::Binance,
            TradeDirection::LongBinanceShortBybit => Exchange::Binance,
            TradeDirection::ShortBinanceLongBybit => Exchange::Bybit,
        }
    }

    /// Exchange holding the short leg.
    pub fn short_exchange(&self) -> Exchange {
        self.long_exchange().counterpart()
    }

    /// Stable identifier used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::LongBybitShortBinance => "LONG_BYBIT_SHORT_BINANCE",
            TradeDirection::ShortBybitLongBinance => "SHORT_BYBIT_LONG_BINANCE",
            TradeDirection::LongBinanceShortBybit => "LONG_BINANCE_SHORT_BYBIT",
            TradeDirection::ShortBinanceLongBybit => "SHORT_BINANCE_LONG_BYBIT",
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chosen direction plus where funding is received and where it is avoided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionResolution {
    pub direction: TradeDirection,
    /// Exchange whose funding is collected (the long leg)
    pub receiving_exchange: Exchange,
    /// Exchange on which a funding payment is avoided (the short leg)
    pub avoided_exchange: Exchange,
}

impl From<TradeDirection> for DirectionResolution {
    fn from(direction: TradeDirection) -> Self {
        Self {
            direction,
            receiving_exchange: direction.long_exchange(),
            avoided_exchange: direction.short_exchange(),
        }
    }
}

/// Pick the trade direction from pay flags and rate signs.
///
/// Exactly one pay flag must be set. A zero rate takes the `>= 0` branch.
pub fn resolve_direction(
    binance_pays: bool,
    bybit_pays: bool,
    binance_rate: Decimal,
    bybit_rate: Decimal,
) -> Result<DirectionResolution, OpportunityError> {
    let direction = match (binance_pays, bybit_pays) {
        (false, true) if bybit_rate < Decimal::ZERO => TradeDirection::LongBybitShortBinance,
        (false, true) => TradeDirection::ShortBybitLongBinance,
        (true, false) if binance_rate < Decimal::ZERO => TradeDirection::LongBinanceShortBybit,
        (true, false) => TradeDirection::ShortBinanceLongBybit,
        (binance_pays, bybit_pays) => {
            return Err(OpportunityError::InvalidPayFlags {
                binance_pays,
                bybit_pays,
            })
        }
    };

    Ok(direction.into())
}

impl Opportunity {
    /// Resolve the trade direction for this opportunity.
    pub fn direction(&self) -> Result<DirectionResolution, OpportunityError> {
        resolve_direction(
            self.binance_pays,
            self.bybit_pays,
            self.binance_rate,
            self.bybit_rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bybit_pays_negative_rate() {
        let r = resolve_direction(false, true, dec!(0.0001), dec!(-0.0005)).unwrap();
        assert_eq!(r.direction, TradeDirection::LongBybitShortBinance);
        assert_eq!(r.receiving_exchange, Exchange::Bybit);
        assert_eq!(r.avoided_exchange, Exchange::Binance);
    }

    #[test]
    fn test_bybit_pays_positive_rate() {
        let r = resolve_direction(false, true, dec!(-0.0001), dec!(0.0005)).unwrap();
        assert_eq!(r.direction, TradeDirection::ShortBybitLongBinance);
        assert_eq!(r.receiving_exchange, Exchange::Binance);
        assert_eq!(r.avoided_exchange, Exchange::Bybit);
    }

    #[test]
    fn test_binance_pays_negative_rate() {
        let r = resolve_direction(true, false, dec!(-0.001), dec!(0.0001)).unwrap();
        assert_eq!(r.direction, TradeDirection::LongBinanceShortBybit);
        assert_eq!(r.receiving_exchange, Exchange::Binance);
        assert_eq!(r.avoided_exchange, Exchange::Bybit);
    }

    #[test]
    fn test_binance_pays_positive_rate() {
        let r = resolve_direction(true, false, dec!(0.001), dec!(-0.0001)).unwrap();
        assert_eq!(r.direction, TradeDirection::ShortBinanceLongBybit);
        assert_eq!(r.receiving_exchange, Exchange::Bybit);
        assert_eq!(r.avoided_exchange, Exchange::Binance);
    }

    #[test]
    fn test_zero_rate_takes_non_negative_branch() {
        let by = resolve_direction(false, true, dec!(0), Decimal::ZERO).unwrap();
        assert_eq!(by.direction, TradeDirection::ShortBybitLongBinance);

        let bn = resolve_direction(true, false, Decimal::ZERO, dec!(0)).unwrap();
        assert_eq!(bn.direction, TradeDirection::ShortBinanceLongBybit);
    }

    #[test]
    fn test_only_paying_rate_matters() {
        // Hedge exchange rate sign never changes the result
        for other in [dec!(-1), dec!(0), dec!(1)] {
            let r = resolve_direction(true, false, dec!(-0.002), other).unwrap();
            assert_eq!(r.direction, TradeDirection::LongBinanceShortBybit);
        }
    }

    #[test]
    fn test_invalid_pay_flags() {
        assert_eq!(
            resolve_direction(true, true, dec!(0.001), dec!(0.001)),
            Err(OpportunityError::InvalidPayFlags {
                binance_pays: true,
                bybit_pays: true
            })
        );
        assert!(resolve_direction(false, false, dec!(0.001), dec!(0.001)).is_err());
    }

    #[test]
    fn test_direction_totality() {
        let rates = [dec!(-0.01), dec!(-0.0001), Decimal::ZERO, dec!(0.0001), dec!(0.01)];
        for (bn_pays, by_pays) in [(true, false), (false, true)] {
            for bn_rate in rates {
                for by_rate in rates {
                    let r = resolve_direction(bn_pays, by_pays, bn_rate, by_rate).unwrap();
                    assert!(TradeDirection::ALL.contains(&r.direction));
                    assert_ne!(r.receiving_exchange, r.avoided_exchange);
                    assert_eq!(r.receiving_exchange, r.direction.long_exchange());
                }
            }
        }
    }

    #[test]
    fn test_legs_are_opposite() {
        for d in TradeDirection::ALL {
            assert_ne!(d.long_exchange(), d.short_exchange());
        }
    }

    #[test]
    fn test_opportunity_direction() {
        let opp = Opportunity::new(1, "BTCUSDT", dec!(100), dec!(-0.001), dec!(0), true, false);
        assert_eq!(
            opp.direction().unwrap().direction,
            TradeDirection::LongBinanceShortBybit
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TradeDirection::ShortBinanceLongBybit.to_string(),
            "SHORT_BINANCE_LONG_BYBIT"
        );
    }
}
