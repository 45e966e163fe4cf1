//! Volume-weighted execution prices.
//!
//! A fill price is the VWAP of typical prices `(high + low + close) / 3`
//! over the candles inside a window. Entry uses `[t - w, t]` and exit uses
//! `[t, t + w]`, each evaluated separately on Binance and Bybit. Sparse or
//! zero-volume windows yield [`VwapResult::Unavailable`] instead of a
//! sentinel price.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use super::opportunity::{Opportunity, VwapQuotes};
use crate::exchange::{Candle, Exchange, MarketData, MINUTE_MS};

/// Minimum candles inside a window for a usable price.
pub const DEFAULT_MIN_CANDLES: usize = 3;

/// Why a window produced no price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// No candle series for the symbol on this exchange
    NoCandleData,
    InsufficientCandles { found: usize, required: usize },
    ZeroVolume,
    NonPositivePrice,
    /// Accumulated value exceeded decimal range
    Overflow,
}

impl UnavailableReason {
    /// Stable key for aggregating reasons.
    pub fn label(&self) -> &'static str {
        match self {
            UnavailableReason::NoCandleData => "no_candle_data",
            UnavailableReason::InsufficientCandles { .. } => "insufficient_candles",
            UnavailableReason::ZeroVolume => "zero_volume",
            UnavailableReason::NonPositivePrice => "non_positive_price",
            UnavailableReason::Overflow => "overflow",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::InsufficientCandles { found, required } => {
                write!(f, "insufficient candles ({} < {})", found, required)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Outcome of a VWAP computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VwapResult {
    /// Strictly positive price.
    Available(Decimal),
    Unavailable(UnavailableReason),
}

impl VwapResult {
    pub fn price(&self) -> Option<Decimal> {
        match self {
            VwapResult::Available(p) => Some(*p),
            VwapResult::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, VwapResult::Available(_))
    }

    pub fn reason(&self) -> Option<UnavailableReason> {
        match self {
            VwapResult::Available(_) => None,
            VwapResult::Unavailable(r) => Some(*r),
        }
    }
}

/// Inclusive time window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VwapWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl VwapWindow {
    /// `[t - w, t]`
    pub fn entry(timestamp: i64, window_minutes: u32) -> Self {
        Self {
            start_ms: timestamp - i64::from(window_minutes) * MINUTE_MS,
            end_ms: timestamp,
        }
    }

    /// `[t, t + w]`
    pub fn exit(timestamp: i64, window_minutes: u32) -> Self {
        Self {
            start_ms: timestamp,
            end_ms: timestamp + i64::from(window_minutes) * MINUTE_MS,
        }
    }
}

/// Compute the VWAP of `candles` inside `window`.
///
/// `candles` must be sorted ascending by timestamp.
pub fn calculate_vwap(candles: &[Candle], window: VwapWindow, min_candles: usize) -> VwapResult {
    let lo = candles.partition_point(|c| c.timestamp < window.start_ms);
    let hi = candles.partition_point(|c| c.timestamp <= window.end_ms);
    let in_window = if lo < hi { &candles[lo..hi] } else { &[] };

    if in_window.len() < min_candles.max(1) {
        return VwapResult::Unavailable(UnavailableReason::InsufficientCandles {
            found: in_window.len(),
            required: min_candles.max(1),
        });
    }

    let mut value = Decimal::ZERO;
    let mut volume = Decimal::ZERO;
    for c in in_window {
        let weighted = c.typical_price().checked_mul(c.volume);
        match (weighted.and_then(|w| value.checked_add(w)), volume.checked_add(c.volume)) {
            (Some(v), Some(vol)) => {
                value = v;
                volume = vol;
            }
            _ => return VwapResult::Unavailable(UnavailableReason::Overflow),
        }
    }

    if volume <= Decimal::ZERO {
        return VwapResult::Unavailable(UnavailableReason::ZeroVolume);
    }

    let vwap = value / volume;
    if vwap <= Decimal::ZERO {
        return VwapResult::Unavailable(UnavailableReason::NonPositivePrice);
    }

    VwapResult::Available(vwap)
}

/// The four per-opportunity VWAP results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VwapQuoteSet {
    pub entry_binance: VwapResult,
    pub entry_bybit: VwapResult,
    pub exit_binance: VwapResult,
    pub exit_bybit: VwapResult,
}

impl VwapQuoteSet {
    /// Prices to attach to the opportunity.
    pub fn to_quotes(&self) -> VwapQuotes {
        VwapQuotes {
            entry_binance: self.entry_binance.price(),
            entry_bybit: self.entry_bybit.price(),
            exit_binance: self.exit_binance.price(),
            exit_bybit: self.exit_bybit.price(),
        }
    }

    /// First missing price's reason, in entry/exit, binance/bybit order.
    pub fn first_unavailable(&self) -> Option<UnavailableReason> {
        [
            self.entry_binance,
            self.entry_bybit,
            self.exit_binance,
            self.exit_bybit,
        ]
        .iter()
        .find_map(|r| r.reason())
    }
}

/// Stateless VWAP evaluator for opportunities.
#[derive(Debug, Clone, Copy)]
pub struct VwapCalculator {
    pub window_minutes: u32,
    pub min_candles: usize,
}

impl Default for VwapCalculator {
    fn default() -> Self {
        Self {
            window_minutes: 5,
            min_candles: DEFAULT_MIN_CANDLES,
        }
    }
}

impl VwapCalculator {
    pub fn new(window_minutes: u32, min_candles: usize) -> Self {
        Self {
            window_minutes,
            min_candles,
        }
    }

    fn quote(&self, candles: Option<&[Candle]>, window: VwapWindow) -> VwapResult {
        match candles {
            Some(c) => calculate_vwap(c, window, self.min_candles),
            None => VwapResult::Unavailable(UnavailableReason::NoCandleData),
        }
    }

    /// Evaluate the entry and exit windows on both exchanges.
    pub fn quotes_for(&self, opportunity: &Opportunity, market: &MarketData) -> VwapQuoteSet {
        let entry = VwapWindow::entry(opportunity.timestamp, self.window_minutes);
        let exit = VwapWindow::exit(opportunity.timestamp, self.window_minutes);
        let binance = market.candles(&opportunity.symbol, Exchange::Binance);
        let bybit = market.candles(&opportunity.symbol, Exchange::Bybit);

        VwapQuoteSet {
            entry_binance: self.quote(binance, entry),
            entry_bybit: self.quote(bybit, entry),
            exit_binance: self.quote(binance, exit),
            exit_bybit: self.quote(bybit, exit),
        }
    }
}

/// Outcome counts of a VWAP attachment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VwapStats {
    pub total: usize,
    pub priced: usize,
    pub unpriced: usize,
    /// Opportunities that already carried prices and were left untouched
    pub already_attached: usize,
    /// Count of unpriced opportunities per first missing reason
    pub reasons: BTreeMap<String, usize>,
}

impl VwapStats {
    /// Record one opportunity's result.
    pub fn record(&mut self, set: &VwapQuoteSet) {
        self.total += 1;
        match set.first_unavailable() {
            None => self.priced += 1,
            Some(reason) => {
                self.unpriced += 1;
                *self.reasons.entry(reason.label().to_string()).or_default() += 1;
            }
        }
    }

    /// Share of opportunities priced, in percent.
    pub fn priced_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.priced as f64 / self.total as f64 * 100.0
        }
    }
}

/// Attach a computed quote set to its opportunity, updating `stats`.
pub fn apply_quotes(opportunity: &mut Opportunity, set: &VwapQuoteSet, stats: &mut VwapStats) {
    match opportunity.attach_vwaps(set.to_quotes()) {
        Ok(()) => {
            stats.record(set);
            if let Some(reason) = set.first_unavailable() {
                debug!(
                    symbol = %opportunity.symbol,
                    timestamp = opportunity.timestamp,
                    reason = %reason,
                    "VWAP unavailable"
                );
            }
        }
        Err(e) => {
            stats.already_attached += 1;
            warn!(error = %e, "Skipping VWAP attachment");
        }
    }
}

/// Compute and attach VWAPs for every opportunity, in order.
pub fn attach_vwaps(
    calculator: &VwapCalculator,
    opportunities: &mut [Opportunity],
    market: &MarketData,
) -> VwapStats {
    let mut stats = VwapStats::default();

    for opp in opportunities.iter_mut() {
        let set = calculator.quotes_for(opp, market);
        apply_quotes(opp, &set, &mut stats);
    }

    info!(
        total = stats.total,
        priced = stats.priced,
        unpriced = stats.unpriced,
        "VWAP attachment complete ({:.1}% priced)",
        stats.priced_pct()
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(minute: i64, high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> Candle {
        Candle {
            timestamp: minute * MINUTE_MS,
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    fn flat(minute: i64, price: Decimal, volume: Decimal) -> Candle {
        candle(minute, price, price, price, volume)
    }

    fn window(start_min: i64, end_min: i64) -> VwapWindow {
        VwapWindow {
            start_ms: start_min * MINUTE_MS,
            end_ms: end_min * MINUTE_MS,
        }
    }

    // =========================================================================
    // Core VWAP Tests
    // =========================================================================

    #[test]
    fn test_vwap_weights_by_volume() {
        let candles = vec![
            flat(0, dec!(100), dec!(1)),
            flat(1, dec!(110), dec!(3)),
            flat(2, dec!(90), dec!(1)),
        ];
        // (100*1 + 110*3 + 90*1) / 5 = 104
        assert_eq!(
            calculate_vwap(&candles, window(0, 2), 3),
            VwapResult::Available(dec!(104))
        );
    }

    #[test]
    fn test_vwap_uses_typical_price() {
        let candles = vec![
            candle(0, dec!(12), dec!(9), dec!(12), dec!(1)),
            candle(1, dec!(12), dec!(9), dec!(12), dec!(1)),
            candle(2, dec!(12), dec!(9), dec!(12), dec!(1)),
        ];
        assert_eq!(
            calculate_vwap(&candles, window(0, 2), 3).price(),
            Some(dec!(11))
        );
    }

    #[test]
    fn test_window_bounds_inclusive() {
        let candles: Vec<Candle> = (0..10).map(|m| flat(m, Decimal::from(m + 1), dec!(1))).collect();
        // minutes 3,4,5 -> prices 4,5,6
        assert_eq!(
            calculate_vwap(&candles, window(3, 5), 3).price(),
            Some(dec!(5))
        );
    }

    #[test]
    fn test_insufficient_candles() {
        let candles = vec![flat(0, dec!(10), dec!(1)), flat(1, dec!(10), dec!(1))];
        assert_eq!(
            calculate_vwap(&candles, window(0, 5), 3),
            VwapResult::Unavailable(UnavailableReason::InsufficientCandles {
                found: 2,
                required: 3
            })
        );
    }

    #[test]
    fn test_empty_window() {
        let candles = vec![flat(100, dec!(10), dec!(1))];
        assert!(!calculate_vwap(&candles, window(0, 5), 3).is_available());
        assert!(!calculate_vwap(&[], window(0, 5), 3).is_available());
    }

    #[test]
    fn test_zero_volume_unavailable() {
        let candles: Vec<Candle> = (0..5).map(|m| flat(m, dec!(10), Decimal::ZERO)).collect();
        assert_eq!(
            calculate_vwap(&candles, window(0, 4), 3),
            VwapResult::Unavailable(UnavailableReason::ZeroVolume)
        );
    }

    #[test]
    fn test_vwap_bounded_by_window_range() {
        let candles = vec![
            candle(0, dec!(105), dec!(95), dec!(100), dec!(7)),
            candle(1, dec!(120), dec!(99), dec!(118), dec!(0.5)),
            candle(2, dec!(101), dec!(80), dec!(81), dec!(13)),
            candle(3, dec!(90), dec!(85), dec!(88), dec!(2)),
            candle(4, dec!(1000), dec!(1), dec!(500), dec!(1)),
        ];
        let w = window(0, 3);
        let price = calculate_vwap(&candles, w, 3).price().unwrap();

        let in_window = &candles[..4];
        let min_low = in_window.iter().map(|c| c.low).min().unwrap();
        let max_high = in_window.iter().map(|c| c.high).max().unwrap();
        assert!(price >= min_low && price <= max_high);
    }

    #[test]
    fn test_entry_exit_windows() {
        let t = 1_000 * MINUTE_MS;
        assert_eq!(
            VwapWindow::entry(t, 5),
            VwapWindow {
                start_ms: t - 5 * MINUTE_MS,
                end_ms: t
            }
        );
        assert_eq!(
            VwapWindow::exit(t, 5),
            VwapWindow {
                start_ms: t,
                end_ms: t + 5 * MINUTE_MS
            }
        );
    }

    // =========================================================================
    // Calculator & Attachment Tests
    // =========================================================================

    fn market() -> MarketData {
        let binance: Vec<Candle> = (0..=20).map(|m| flat(m, dec!(100), dec!(1))).collect();
        let bybit: Vec<Candle> = (0..=20).map(|m| flat(m, dec!(50), dec!(2))).collect();
        MarketData::new()
            .with_candles("BTCUSDT", Exchange::Binance, binance)
            .with_candles("BTCUSDT", Exchange::Bybit, bybit)
            .with_candles("ETHUSDT", Exchange::Binance, vec![flat(10, dec!(3), dec!(1))])
    }

    fn opportunity(symbol: &str, minute: i64) -> Opportunity {
        Opportunity::new(
            minute * MINUTE_MS,
            symbol,
            dec!(1000),
            dec!(0.001),
            dec!(0),
            true,
            false,
        )
    }

    #[test]
    fn test_quotes_for_complete() {
        let calc = VwapCalculator::new(5, 3);
        let set = calc.quotes_for(&opportunity("BTCUSDT", 10), &market());

        assert_eq!(set.first_unavailable(), None);
        let quotes = set.to_quotes();
        assert_eq!(quotes.entry_binance, Some(dec!(100)));
        assert_eq!(quotes.exit_bybit, Some(dec!(50)));
    }

    #[test]
    fn test_quotes_for_missing_exchange() {
        let calc = VwapCalculator::new(5, 3);
        let set = calc.quotes_for(&opportunity("ETHUSDT", 10), &market());

        assert_eq!(
            set.entry_bybit,
            VwapResult::Unavailable(UnavailableReason::NoCandleData)
        );
        assert!(!set.to_quotes().is_complete());
    }

    #[test]
    fn test_attach_vwaps_counts() {
        let calc = VwapCalculator::default();
        let mut opps = vec![
            opportunity("BTCUSDT", 10),
            opportunity("ETHUSDT", 10),
            opportunity("XRPUSDT", 10),
            // Exit window runs past the data
            opportunity("BTCUSDT", 19),
        ];

        let stats = attach_vwaps(&calc, &mut opps, &market());

        assert_eq!(stats.total, 4);
        assert_eq!(stats.priced, 1);
        assert_eq!(stats.unpriced, 3);
        assert!(opps[0].is_price_valid());
        assert!(!opps[1].is_price_valid());
        assert!(!opps[3].is_price_valid());
        assert_eq!(stats.reasons.get("insufficient_candles"), Some(&2));
        assert_eq!(stats.reasons.get("no_candle_data"), Some(&1));
    }

    #[test]
    fn test_attach_vwaps_twice_leaves_prices() {
        let calc = VwapCalculator::default();
        let mut opps = vec![opportunity("BTCUSDT", 10)];
        attach_vwaps(&calc, &mut opps, &market());

        let stats = attach_vwaps(&calc, &mut opps, &MarketData::new());
        assert_eq!(stats.already_attached, 1);
        assert!(opps[0].is_price_valid());
    }
}
