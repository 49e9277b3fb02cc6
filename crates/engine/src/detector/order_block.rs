//! Order blocks: the last opposing candle before a strong displacement.

use crate::config::DetectorConfig;
use crate::indicators::rolling_mean_body;
use crate::types::{Candle, Direction, PatternType};

use super::{passes_size_filter, window_usable, Candidate, PatternDetector};

/// How far back (in candles) to look for the opposing candle
const OPPOSING_LOOKBACK: usize = 3;

pub struct OrderBlockDetector {
    config: DetectorConfig,
}

impl OrderBlockDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Most recent opposing candle within reach of `index` whose body passes the size filter
    fn opposing_zone(
        &self,
        candles: &[Candle],
        usable: &[bool],
        index: usize,
        want_bearish: bool,
    ) -> Option<(usize, Candle)> {
        let earliest = index.saturating_sub(OPPOSING_LOOKBACK);
        (earliest..index).rev().find_map(|j| {
            let candle = &candles[j];
            let opposing = if want_bearish {
                candle.is_bearish()
            } else {
                candle.is_bullish()
            };
            if !usable[j] || !opposing {
                return None;
            }
            let high = candle.open.max(candle.close);
            let low = candle.open.min(candle.close);
            passes_size_filter(high, low, self.config.min_zone_pct).then(|| (j, candle.clone()))
        })
    }
}

impl PatternDetector for OrderBlockDetector {
    fn pattern_type(&self) -> PatternType {
        PatternType::OrderBlock
    }

    fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn candidates(&self, candles: &[Candle], usable: &[bool]) -> Vec<Candidate> {
        let window = self.config.ob_body_window.max(1);
        let mean_body = rolling_mean_body(candles, window);
        let mut out = Vec::new();

        for i in OPPOSING_LOOKBACK..candles.len() {
            let Some(avg) = mean_body[i] else { continue };
            if avg.is_zero() || !window_usable(usable, (i + 1).saturating_sub(window), i) {
                continue;
            }

            let current = &candles[i];
            if current.body() <= avg * self.config.ob_strength_multiplier {
                continue;
            }

            let (direction, want_bearish) = if current.is_bullish() {
                (Direction::Bullish, true)
            } else if current.is_bearish() {
                (Direction::Bearish, false)
            } else {
                continue;
            };

            if let Some((_, block)) = self.opposing_zone(candles, usable, i, want_bearish) {
                out.push(Candidate {
                    index: i,
                    direction,
                    zone_high: block.open.max(block.close),
                    zone_low: block.open.min(block.close),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::test_support::{c, make_candles};
    use rust_decimal_macros::dec;

    #[test]
    fn test_bullish_order_block() {
        let mut candles = make_candles(0, 22, 100);
        // bearish candle followed by a strong bullish displacement
        candles.push(c(22, 101, 101, 98, 99));
        candles.push(c(23, 99, 110, 99, 109));

        let zones = OrderBlockDetector::new(DetectorConfig::default()).detect(&candles, true);
        let last = zones.last().expect("order block detected");
        assert_eq!(last.direction, Direction::Bullish);
        assert_eq!(last.zone_low, dec!(99));
        assert_eq!(last.zone_high, dec!(101));
        assert_eq!(last.detected_at, 23 * 60_000);
    }

    #[test]
    fn test_bearish_order_block() {
        let mut candles = make_candles(0, 22, 100);
        candles.push(c(22, 99, 102, 99, 101));
        candles.push(c(23, 101, 101, 90, 91));

        let zones = OrderBlockDetector::new(DetectorConfig::default()).detect(&candles, true);
        let last = zones.last().expect("order block detected");
        assert_eq!(last.direction, Direction::Bearish);
        assert_eq!(last.zone_low, dec!(99));
        assert_eq!(last.zone_high, dec!(101));
    }

    #[test]
    fn test_needs_full_body_window() {
        let mut candles = make_candles(0, 5, 100);
        candles.push(c(5, 101, 101, 98, 99));
        candles.push(c(6, 99, 110, 99, 109));
        let zones = OrderBlockDetector::new(DetectorConfig::default()).detect(&candles, true);
        assert!(zones.is_empty());
    }

    #[test]
    fn test_weak_move_is_ignored() {
        let candles = make_candles(0, 30, 100);
        let zones = OrderBlockDetector::new(DetectorConfig::default()).detect(&candles, true);
        assert!(zones.is_empty());
    }
}
