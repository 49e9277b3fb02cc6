//! Pattern detectors
//!
//! Detectors are plain values built per invocation from a `DetectorConfig`.
//! Each one proposes raw candidate zones; the shared `detect` pipeline then
//! validates candles, applies the zone-size filter and the overlap dedup, and
//! attaches market context. Detection is causal, so running it over a longer
//! history never changes zones found on a prefix of that history.

mod fvg;
mod liquidity;
mod order_block;

pub use fvg::FvgDetector;
pub use liquidity::LiquiditySweepDetector;
pub use order_block::OrderBlockDetector;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::indicators::{atr_series, recent_extremes};
use crate::types::{Candle, Direction, PatternType, PatternZone, ZoneContext};

/// A zone proposed by a detector before filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Index of the candle that completes the pattern
    pub index: usize,
    pub direction: Direction,
    pub zone_high: Decimal,
    pub zone_low: Decimal,
}

pub trait PatternDetector: Send + Sync {
    fn pattern_type(&self) -> PatternType;

    fn config(&self) -> &DetectorConfig;

    /// Candidates in ascending index order. `usable[i]` is false for candles
    /// that are malformed or out of order; any window touching one is skipped.
    fn candidates(&self, candles: &[Candle], usable: &[bool]) -> Vec<Candidate>;

    /// Run the full detection pipeline over a candle series
    fn detect(&self, candles: &[Candle], skip_overlap: bool) -> Vec<PatternZone> {
        let config = self.config();
        let usable = usable_mask(candles);
        let skipped = usable.iter().filter(|ok| !**ok).count();
        if skipped > 0 {
            warn!(
                pattern = %self.pattern_type(),
                skipped,
                "Skipping malformed or out-of-order candles"
            );
        }

        let atr = atr_series(candles, config.atr_period);
        let mut accepted: Vec<PatternZone> = Vec::new();
        let mut active: Vec<PatternZone> = Vec::new();
        let mut mitigated_through = 0usize;

        for candidate in self.candidates(candles, &usable) {
            if !passes_size_filter(candidate.zone_high, candidate.zone_low, config.min_zone_pct) {
                continue;
            }

            let zone = PatternZone {
                pattern_type: self.pattern_type(),
                direction: candidate.direction,
                zone_high: candidate.zone_high,
                zone_low: candidate.zone_low,
                detected_at: candles[candidate.index].timestamp,
                context: zone_context(candles, candidate.index, &atr, config.context_lookback),
            };

            if !skip_overlap {
                // retire zones that price has traded through up to this candle
                while mitigated_through < candidate.index {
                    mitigated_through += 1;
                    let candle = &candles[mitigated_through];
                    if usable[mitigated_through] {
                        active.retain(|z| !is_mitigated(z, candle));
                    }
                }
                if let Some(existing) = active
                    .iter()
                    .find(|z| overlap_fraction(&zone, z) > config.overlap_threshold)
                {
                    debug!(
                        pattern = %zone.pattern_type,
                        detected_at = zone.detected_at,
                        overlaps = existing.detected_at,
                        "Suppressing overlapping zone"
                    );
                    continue;
                }
                active.push(zone.clone());
            }

            accepted.push(zone);
        }

        accepted
    }
}

/// Build the detector for a pattern family
pub fn build_detector(pattern_type: PatternType, config: DetectorConfig) -> Box<dyn PatternDetector> {
    match pattern_type {
        PatternType::Fvg => Box::new(FvgDetector::new(config)),
        PatternType::OrderBlock => Box::new(OrderBlockDetector::new(config)),
        PatternType::LiquiditySweep => Box::new(LiquiditySweepDetector::new(config)),
    }
}

/// Convenience wrapper: build and run a detector in one call
pub fn detect(
    pattern_type: PatternType,
    config: &DetectorConfig,
    candles: &[Candle],
    skip_overlap: bool,
) -> Vec<PatternZone> {
    build_detector(pattern_type, config.clone()).detect(candles, skip_overlap)
}

/// Zone width must be positive and at least `min_zone_pct` percent of its midpoint
pub fn passes_size_filter(zone_high: Decimal, zone_low: Decimal, min_zone_pct: Decimal) -> bool {
    let width = zone_high - zone_low;
    if width <= Decimal::ZERO || zone_low <= Decimal::ZERO {
        return false;
    }
    let mid = (zone_high + zone_low) / Decimal::TWO;
    width / mid * Decimal::ONE_HUNDRED >= min_zone_pct
}

/// Share of the new zone's width covered by an existing same-direction zone
pub fn overlap_fraction(new: &PatternZone, existing: &PatternZone) -> Decimal {
    if new.direction != existing.direction {
        return Decimal::ZERO;
    }
    let width = new.width();
    if width <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let low = new.zone_low.max(existing.zone_low);
    let high = new.zone_high.min(existing.zone_high);
    if high <= low {
        return Decimal::ZERO;
    }
    (high - low) / width
}

fn is_mitigated(zone: &PatternZone, candle: &Candle) -> bool {
    if candle.timestamp <= zone.detected_at {
        return false;
    }
    match zone.direction {
        Direction::Bullish => candle.low < zone.zone_low,
        Direction::Bearish => candle.high > zone.zone_high,
    }
}

/// Well-formed candles whose timestamp strictly increases over the last usable one
fn usable_mask(candles: &[Candle]) -> Vec<bool> {
    let mut last_ts: Option<i64> = None;
    candles
        .iter()
        .map(|c| {
            let in_order = last_ts.map_or(true, |ts| c.timestamp > ts);
            let ok = in_order && c.is_well_formed();
            if ok {
                last_ts = Some(c.timestamp);
            }
            ok
        })
        .collect()
}

fn zone_context(
    candles: &[Candle],
    index: usize,
    atr: &[Option<Decimal>],
    lookback: usize,
) -> ZoneContext {
    let extremes = recent_extremes(candles, index, lookback);
    ZoneContext {
        atr: atr.get(index).copied().flatten(),
        swing_high: extremes.map(|(high, _)| high),
        swing_low: extremes.map(|(_, low)| low),
    }
}

/// True when every candle in `start..=end_inclusive` is usable
pub(crate) fn window_usable(usable: &[bool], start: usize, end_inclusive: usize) -> bool {
    usable
        .get(start..=end_inclusive)
        .map_or(false, |w| w.iter().all(|ok| *ok))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::Candle;
    use rust_decimal::Decimal;

    /// Candle at minute `i` from (open, high, low, close)
    pub fn c(i: i64, o: i64, h: i64, l: i64, cl: i64) -> Candle {
        Candle {
            timestamp: i * 60_000,
            open: Decimal::from(o),
            high: Decimal::from(h),
            low: Decimal::from(l),
            close: Decimal::from(cl),
            volume: Decimal::from(100),
        }
    }

    /// Quiet candles oscillating a point around `price`
    pub fn make_candles(start: i64, count: i64, price: i64) -> Vec<Candle> {
        (start..start + count)
            .map(|i| {
                if i % 2 == 0 {
                    c(i, price, price + 1, price - 1, price + 1)
                } else {
                    c(i, price + 1, price + 2, price, price)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rust_decimal_macros::dec;

    fn bullish_gap_series() -> Vec<Candle> {
        // two identical bullish gaps at indices 2 and 5 over the same range
        vec![
            c(0, 100, 101, 99, 100),
            c(1, 101, 110, 100, 109),
            c(2, 109, 112, 103, 111),
            c(3, 100, 101, 99, 100),
            c(4, 101, 110, 100, 109),
            c(5, 109, 112, 103, 111),
        ]
    }

    #[test]
    fn test_overlap_dedup_suppresses_repeat_zone() {
        let config = DetectorConfig::default();
        let with_dedup = detect(PatternType::Fvg, &config, &bullish_gap_series(), false);
        let without = detect(PatternType::Fvg, &config, &bullish_gap_series(), true);
        assert_eq!(without.len(), 2);
        // candle 3 trades below 101, the first zone is mitigated before the second forms
        assert_eq!(with_dedup.len(), 2);

        // same gap again with no candle trading below the first zone
        let mut unmitigated = bullish_gap_series();
        unmitigated[3] = c(3, 101, 101, 101, 101);
        unmitigated[4] = c(4, 101, 110, 101, 109);
        let deduped = detect(PatternType::Fvg, &config, &unmitigated, false);
        let raw = detect(PatternType::Fvg, &config, &unmitigated, true);
        assert_eq!(raw.len(), 2);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].detected_at, 2 * 60_000);
    }

    #[test]
    fn test_size_filter() {
        assert!(passes_size_filter(dec!(100.2), dec!(100), dec!(0.15)));
        assert!(!passes_size_filter(dec!(100.1), dec!(100), dec!(0.15)));
        assert!(!passes_size_filter(dec!(100), dec!(100), dec!(0)));
    }

    #[test]
    fn test_overlap_fraction() {
        let zone = |low, high| PatternZone {
            pattern_type: PatternType::Fvg,
            direction: Direction::Bullish,
            zone_high: high,
            zone_low: low,
            detected_at: 0,
            context: ZoneContext::default(),
        };
        assert_eq!(overlap_fraction(&zone(dec!(100), dec!(110)), &zone(dec!(102), dec!(120))), dec!(0.8));
        assert_eq!(overlap_fraction(&zone(dec!(100), dec!(110)), &zone(dec!(120), dec!(130))), dec!(0));
    }

    #[test]
    fn test_detection_is_deterministic_and_causal() {
        let mut candles = make_candles(0, 30, 100);
        candles.extend(vec![
            c(30, 100, 101, 99, 100),
            c(31, 101, 110, 100, 109),
            c(32, 109, 112, 103, 111),
        ]);
        candles.extend(make_candles(33, 30, 111));

        for pattern in PatternType::ALL {
            let config = DetectorConfig::default();
            let full = detect(pattern, &config, &candles, false);
            assert_eq!(full, detect(pattern, &config, &candles, false));

            let prefix = detect(pattern, &config, &candles[..40], false);
            let cutoff = candles[39].timestamp;
            let full_prefix: Vec<_> = full.into_iter().filter(|z| z.detected_at <= cutoff).collect();
            assert_eq!(prefix, full_prefix, "{pattern} detection looked ahead");
        }
    }

    #[test]
    fn test_malformed_candles_are_skipped_not_fatal() {
        let mut candles = bullish_gap_series();
        candles[1].high = dec!(90); // high < low
        let zones = detect(PatternType::Fvg, &DetectorConfig::default(), &candles, true);
        // only the second gap survives
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].detected_at, 5 * 60_000);

        let mut out_of_order = bullish_gap_series();
        out_of_order[4].timestamp = 0;
        let zones = detect(PatternType::Fvg, &DetectorConfig::default(), &out_of_order, true);
        assert_eq!(zones.len(), 1);
    }
}
