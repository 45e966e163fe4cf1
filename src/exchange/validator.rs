//! Kline data quality checks: coverage, gaps and anomalies.

use rust_decimal::Decimal;
use serde::Serialize;

use super::types::{Candle, MINUTE_MS};

/// Minimum fraction of expected one-minute candles.
pub const COVERAGE_THRESHOLD: f64 = 0.95;

/// Consecutive candles further apart than this count as a gap.
pub const MAX_GAP_MINUTES: i64 = 5;

/// Data quality problems found in a candle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KlineAnomaly {
    /// At least one candle with zero or negative volume
    NonPositiveVolume,
    /// At least one candle with zero or negative close
    NonPositiveClose,
}

/// Result of validating one candle window.
#[derive(Debug, Clone, Serialize)]
pub struct KlineValidation {
    pub expected_candles: usize,
    pub actual_candles: usize,
    /// Coverage in percent (0-100)
    pub coverage_pct: f64,
    /// Number of gaps longer than [`MAX_GAP_MINUTES`]
    pub gaps: usize,
    pub anomalies: Vec<KlineAnomaly>,
    pub is_valid: bool,
}

/// Validate completeness and sanity of `candles` within `[start_ms, end_ms]`.
pub fn validate_klines(candles: &[Candle], start_ms: i64, end_ms: i64) -> KlineValidation {
    let expected_candles = ((end_ms - start_ms).max(0) / MINUTE_MS) as usize;

    let window: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.timestamp >= start_ms && c.timestamp <= end_ms)
        .collect();
    let actual_candles = window.len();

    let coverage = if expected_candles > 0 {
        actual_candles as f64 / expected_candles as f64
    } else {
        0.0
    };

    let gaps = window
        .windows(2)
        .filter(|w| w[1].timestamp - w[0].timestamp > MAX_GAP_MINUTES * MINUTE_MS)
        .count();

    let mut anomalies = Vec::new();
    if window.iter().any(|c| c.volume <= Decimal::ZERO) {
        anomalies.push(KlineAnomaly::NonPositiveVolume);
    }
    if window.iter().any(|c| c.close <= Decimal::ZERO) {
        anomalies.push(KlineAnomaly::NonPositiveClose);
    }

    let is_valid = coverage >= COVERAGE_THRESHOLD && gaps == 0 && anomalies.is_empty();

    KlineValidation {
        expected_candles,
        actual_candles,
        coverage_pct: coverage * 100.0,
        gaps,
        anomalies,
        is_valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(minute: i64) -> Candle {
        Candle {
            timestamp: minute * MINUTE_MS,
            open: dec!(10),
            high: dec!(11),
            low: dec!(9),
            close: dec!(10),
            volume: dec!(3),
        }
    }

    #[test]
    fn test_complete_window_is_valid() {
        let candles: Vec<Candle> = (0..60).map(candle).collect();
        let v = validate_klines(&candles, 0, 60 * MINUTE_MS);

        assert_eq!(v.expected_candles, 60);
        assert_eq!(v.actual_candles, 60);
        assert_eq!(v.gaps, 0);
        assert!(v.is_valid);
    }

    #[test]
    fn test_gap_invalidates() {
        let candles: Vec<Candle> = (0..60).filter(|m| !(20..27).contains(m)).map(candle).collect();
        let v = validate_klines(&candles, 0, 60 * MINUTE_MS);

        assert_eq!(v.gaps, 1);
        assert!(!v.is_valid);
    }

    #[test]
    fn test_low_coverage_invalidates() {
        let candles: Vec<Candle> = (0..60).step_by(2).map(candle).collect();
        let v = validate_klines(&candles, 0, 60 * MINUTE_MS);

        assert!((v.coverage_pct - 50.0).abs() < 1e-9);
        assert!(!v.is_valid);
    }

    #[test]
    fn test_anomalies_detected() {
        let mut candles: Vec<Candle> = (0..10).map(candle).collect();
        candles[3].volume = Decimal::ZERO;
        candles[5].close = dec!(-1);

        let v = validate_klines(&candles, 0, 10 * MINUTE_MS);
        assert_eq!(
            v.anomalies,
            vec![KlineAnomaly::NonPositiveVolume, KlineAnomaly::NonPositiveClose]
        );
        assert!(!v.is_valid);
    }

    #[test]
    fn test_empty_range() {
        let v = validate_klines(&[], 0, 0);
        assert_eq!(v.expected_candles, 0);
        assert!(!v.is_valid);
    }
}
