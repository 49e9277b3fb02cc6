//! Fair value gaps: a three-candle imbalance where the first and third
//! candles' wicks do not overlap.

use crate::config::DetectorConfig;
use crate::types::{Candle, Direction, PatternType};

use super::{window_usable, Candidate, PatternDetector};

pub struct FvgDetector {
    config: DetectorConfig,
}

impl FvgDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
}

impl PatternDetector for FvgDetector {
    fn pattern_type(&self) -> PatternType {
        PatternType::Fvg
    }

    fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn candidates(&self, candles: &[Candle], usable: &[bool]) -> Vec<Candidate> {
        let mut out = Vec::new();
        for i in 2..candles.len() {
            if !window_usable(usable, i - 2, i) {
                continue;
            }
            let first = &candles[i - 2];
            let third = &candles[i];

            if first.high < third.low {
                out.push(Candidate {
                    index: i,
                    direction: Direction::Bullish,
                    zone_high: third.low,
                    zone_low: first.high,
                });
            } else if first.low > third.high {
                out.push(Candidate {
                    index: i,
                    direction: Direction::Bearish,
                    zone_high: first.low,
                    zone_low: third.high,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::test_support::c;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bullish_gap() {
        let candles = vec![
            c(0, 100, 101, 99, 100),
            c(1, 101, 110, 100, 109),
            c(2, 109, 112, 103, 111),
        ];
        let zones = FvgDetector::new(DetectorConfig::default()).detect(&candles, true);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].direction, Direction::Bullish);
        assert_eq!(zones[0].zone_low, dec!(101));
        assert_eq!(zones[0].zone_high, dec!(103));
        assert_eq!(zones[0].detected_at, 120_000);
    }

    #[test]
    fn test_bearish_gap() {
        let candles = vec![
            c(0, 110, 111, 108, 109),
            c(1, 108, 109, 99, 100),
            c(2, 100, 104, 98, 99),
        ];
        let zones = FvgDetector::new(DetectorConfig::default()).detect(&candles, true);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].direction, Direction::Bearish);
        assert_eq!(zones[0].zone_low, dec!(104));
        assert_eq!(zones[0].zone_high, dec!(108));
    }

    #[test]
    fn test_overlapping_wicks_are_not_gaps() {
        let candles = vec![
            c(0, 100, 104, 99, 103),
            c(1, 103, 106, 102, 105),
            c(2, 105, 107, 103, 106),
        ];
        let zones = FvgDetector::new(DetectorConfig::default()).detect(&candles, true);
        assert!(zones.is_empty());
    }

    #[test]
    fn test_short_series_yields_nothing() {
        let candles = vec![c(0, 100, 101, 99, 100)];
        assert!(FvgDetector::new(DetectorConfig::default())
            .detect(&candles, true)
            .is_empty());
    }
}
