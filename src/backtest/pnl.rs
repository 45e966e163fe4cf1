//! Round-trip P&L for one hedged trade.
//!
//! Net P&L = price P&L + funding P&L - fees, where each leg is sized at half
//! the allocated capital. Funding is modeled as received on the long leg
//! only; the avoided payment on the short leg counts as zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::direction::TradeDirection;
use super::opportunity::LegPrices;
use crate::exchange::Exchange;
use crate::utils::decimal::{percent_of, safe_div};

/// Exchange fee rates as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker_fee: Decimal,
    /// Applied to every fill (both legs, entry and exit)
    pub taker_fee: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker_fee: Decimal::new(2, 4), // 0.02%
            taker_fee: Decimal::new(4, 4), // 0.04%
        }
    }
}

/// Components of one trade's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    /// Notional per leg
    pub position_size: Decimal,
    pub long_leg_pnl: Decimal,
    pub short_leg_pnl: Decimal,
    /// Sum of both legs
    pub price_pnl: Decimal,
    pub funding_pnl: Decimal,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub net_pnl: Decimal,
    /// Net P&L as a percentage of capital committed to both legs
    pub pnl_pct: Decimal,
}

impl PnlBreakdown {
    pub fn total_fees(&self) -> Decimal {
        self.entry_fee + self.exit_fee
    }
}

/// Fractional move from entry to exit.
///
/// Expects a positive entry price; a zero entry yields a zero return.
pub fn leg_return(entry: Decimal, exit: Decimal) -> Decimal {
    safe_div(exit - entry, entry)
}

/// Price P&L of the `(long, short)` legs.
pub fn price_pnl(
    direction: TradeDirection,
    prices: &LegPrices,
    position_size: Decimal,
) -> (Decimal, Decimal) {
    let binance = leg_return(prices.entry_binance, prices.exit_binance);
    let bybit = leg_return(prices.entry_bybit, prices.exit_bybit);

    let (long_return, short_return) = match direction {
        TradeDirection::LongBybitShortBinance => (bybit, binance),
        TradeDirection::ShortBybitLongBinance => (binance, bybit),
        TradeDirection::LongBinanceShortBybit => (binance, bybit),
        TradeDirection::ShortBinanceLongBybit => (bybit, binance),
    };

    (position_size * long_return, position_size * -short_return)
}

/// Funding collected on the long leg's exchange.
pub fn funding_pnl(
    direction: TradeDirection,
    binance_rate: Decimal,
    bybit_rate: Decimal,
    position_size: Decimal,
) -> Decimal {
    let rate = match direction.long_exchange() {
        Exchange::Binance => binance_rate,
        Exchange::Bybit => bybit_rate,
    };
    position_size * rate.abs()
}

/// `(entry_fee, exit_fee)`: taker fee on both legs at each end.
pub fn trading_fees(position_size: Decimal, fees: &FeeSchedule) -> (Decimal, Decimal) {
    let per_side = position_size * fees.taker_fee * Decimal::TWO;
    (per_side, per_side)
}

/// Compute the full breakdown for one round trip.
pub fn calculate_pnl(
    direction: TradeDirection,
    prices: &LegPrices,
    binance_rate: Decimal,
    bybit_rate: Decimal,
    position_size: Decimal,
    fees: &FeeSchedule,
) -> PnlBreakdown {
    let (long_leg_pnl, short_leg_pnl) = price_pnl(direction, prices, position_size);
    let price_pnl = long_leg_pnl + short_leg_pnl;
    let funding_pnl = funding_pnl(direction, binance_rate, bybit_rate, position_size);
    let (entry_fee, exit_fee) = trading_fees(position_size, fees);

    let net_pnl = price_pnl + funding_pnl - (entry_fee + exit_fee);
    let pnl_pct = percent_of(net_pnl, position_size * Decimal::TWO);

    PnlBreakdown {
        position_size,
        long_leg_pnl,
        short_leg_pnl,
        price_pnl,
        funding_pnl,
        entry_fee,
        exit_fee,
        net_pnl,
        pnl_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices() -> LegPrices {
        LegPrices {
            entry_binance: dec!(100),
            entry_bybit: dec!(50),
            exit_binance: dec!(101),
            exit_bybit: dec!(49.5),
        }
    }

    #[test]
    fn test_leg_return_zero_entry_does_not_panic() {
        assert_eq!(leg_return(dec!(100), dec!(101)), dec!(0.01));
        assert_eq!(leg_return(Decimal::ZERO, dec!(101)), Decimal::ZERO);
    }

    fn fees() -> FeeSchedule {
        FeeSchedule {
            maker_fee: dec!(0.0002),
            taker_fee: dec!(0.0004),
        }
    }

    // =========================================================================
    // Reference Scenario
    // =========================================================================

    #[test]
    fn test_long_binance_short_bybit_scenario() {
        let pnl = calculate_pnl(
            TradeDirection::LongBinanceShortBybit,
            &prices(),
            dec!(-0.001),
            dec!(0.0003),
            dec!(5000),
            &fees(),
        );

        assert_eq!(pnl.long_leg_pnl, dec!(50));
        assert_eq!(pnl.short_leg_pnl, dec!(50));
        assert_eq!(pnl.price_pnl, dec!(100));
        assert_eq!(pnl.funding_pnl, dec!(5));
        assert_eq!(pnl.entry_fee, dec!(4));
        assert_eq!(pnl.exit_fee, dec!(4));
        assert_eq!(pnl.net_pnl, dec!(97));
        assert_eq!(pnl.pnl_pct, dec!(0.97));
    }

    // =========================================================================
    // Price P&L Tests
    // =========================================================================

    #[test]
    fn test_price_pnl_flips_with_direction() {
        let p = prices();
        let (l1, s1) = price_pnl(TradeDirection::LongBinanceShortBybit, &p, dec!(1000));
        let (l2, s2) = price_pnl(TradeDirection::ShortBinanceLongBybit, &p, dec!(1000));

        // Binance +1%, Bybit -1%
        assert_eq!((l1, s1), (dec!(10), dec!(10)));
        assert_eq!((l2, s2), (dec!(-10), dec!(-10)));
    }

    #[test]
    fn test_bybit_directions_mirror_binance_directions() {
        let p = prices();
        assert_eq!(
            price_pnl(TradeDirection::ShortBybitLongBinance, &p, dec!(1000)),
            price_pnl(TradeDirection::LongBinanceShortBybit, &p, dec!(1000))
        );
        assert_eq!(
            price_pnl(TradeDirection::LongBybitShortBinance, &p, dec!(1000)),
            price_pnl(TradeDirection::ShortBinanceLongBybit, &p, dec!(1000))
        );
    }

    #[test]
    fn test_flat_prices_no_price_pnl() {
        let flat = LegPrices {
            entry_binance: dec!(10),
            entry_bybit: dec!(10),
            exit_binance: dec!(10),
            exit_bybit: dec!(10),
        };
        for d in TradeDirection::ALL {
            let (l, s) = price_pnl(d, &flat, dec!(5000));
            assert_eq!(l + s, Decimal::ZERO);
        }
    }

    // =========================================================================
    // Funding Tests
    // =========================================================================

    #[test]
    fn test_funding_uses_receiving_exchange_rate() {
        let bn = dec!(-0.002);
        let by = dec!(0.0005);
        let ps = dec!(1000);

        assert_eq!(funding_pnl(TradeDirection::LongBybitShortBinance, bn, by, ps), dec!(0.5));
        assert_eq!(funding_pnl(TradeDirection::ShortBybitLongBinance, bn, by, ps), dec!(2));
        assert_eq!(funding_pnl(TradeDirection::LongBinanceShortBybit, bn, by, ps), dec!(2));
        assert_eq!(funding_pnl(TradeDirection::ShortBinanceLongBybit, bn, by, ps), dec!(0.5));
    }

    #[test]
    fn test_funding_never_negative() {
        for d in TradeDirection::ALL {
            assert!(funding_pnl(d, dec!(-0.01), dec!(-0.02), dec!(100)) >= Decimal::ZERO);
        }
    }

    // =========================================================================
    // Fee Tests
    // =========================================================================

    #[test]
    fn test_fee_symmetry_across_directions() {
        let ps = dec!(3333.33);
        for d in TradeDirection::ALL {
            let pnl = calculate_pnl(d, &prices(), dec!(0.001), dec!(-0.001), ps, &fees());
            assert_eq!(pnl.total_fees(), ps * fees().taker_fee * dec!(4));
            assert_eq!(pnl.entry_fee, pnl.exit_fee);
        }
    }

    #[test]
    fn test_maker_fee_not_applied() {
        let a = calculate_pnl(
            TradeDirection::LongBinanceShortBybit,
            &prices(),
            dec!(-0.001),
            dec!(0),
            dec!(5000),
            &fees(),
        );
        let b = calculate_pnl(
            TradeDirection::LongBinanceShortBybit,
            &prices(),
            dec!(-0.001),
            dec!(0),
            dec!(5000),
            &FeeSchedule {
                maker_fee: dec!(0.01),
                ..fees()
            },
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_position_pct_is_zero() {
        let pnl = calculate_pnl(
            TradeDirection::ShortBinanceLongBybit,
            &prices(),
            dec!(0.001),
            dec!(0),
            Decimal::ZERO,
            &fees(),
        );
        assert_eq!(pnl.net_pnl, Decimal::ZERO);
        assert_eq!(pnl.pnl_pct, Decimal::ZERO);
    }
}
