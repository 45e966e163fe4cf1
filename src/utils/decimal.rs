//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Express `part` as a percentage of `whole` (zero when `whole` is zero).
pub fn percent_of(part: Decimal, whole: Decimal) -> Decimal {
    safe_div(part, whole) * dec!(100)
}

/// Lossy conversion for statistics that need floating point.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Convert a float statistic back to `Decimal`, mapping NaN/inf to zero.
pub fn from_f64(value: f64) -> Decimal {
    if value.is_finite() {
        Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
    } else {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(dec!(97), dec!(10000)), dec!(0.97));
        assert_eq!(percent_of(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_float_round_trip_guards() {
        assert_eq!(to_f64(dec!(1.5)), 1.5);
        assert_eq!(from_f64(f64::NAN), Decimal::ZERO);
        assert_eq!(from_f64(f64::INFINITY), Decimal::ZERO);
        assert_eq!(from_f64(0.25), dec!(0.25));
    }
}
