//! Liquidity sweeps: a wick through a prior swing extreme that closes back
//! on the other side of it.

use crate::config::DetectorConfig;
use crate::indicators::{swing_points, SwingPoint};
use crate::types::{Candle, Direction, PatternType};

use super::{passes_size_filter, window_usable, Candidate, PatternDetector};

pub struct LiquiditySweepDetector {
    config: DetectorConfig,
}

impl LiquiditySweepDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Swings old enough to be confirmed at `index` and young enough to matter, oldest first
    fn eligible<'a>(
        &'a self,
        swings: &'a [SwingPoint],
        index: usize,
    ) -> impl Iterator<Item = &'a SwingPoint> + 'a {
        let lookback = self.config.swing_lookback;
        let max_age = self.config.sweep_max_age;
        swings
            .iter()
            .filter(move |s| s.index + lookback < index && s.index + max_age >= index)
    }
}

impl PatternDetector for LiquiditySweepDetector {
    fn pattern_type(&self) -> PatternType {
        PatternType::LiquiditySweep
    }

    fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn candidates(&self, candles: &[Candle], usable: &[bool]) -> Vec<Candidate> {
        let lookback = self.config.swing_lookback;
        let (highs, lows) = swing_points(candles, lookback);
        let confirmed = |s: &&SwingPoint| window_usable(usable, s.index - lookback, s.index + lookback);
        let highs: Vec<SwingPoint> = highs.iter().filter(confirmed).copied().collect();
        let lows: Vec<SwingPoint> = lows.iter().filter(confirmed).copied().collect();

        let mut out = Vec::new();
        for (i, current) in candles.iter().enumerate() {
            if !usable[i] {
                continue;
            }

            // bullish: wick below a swing low, close back above it
            let sweep_low = self.eligible(&lows, i).find(|s| {
                current.low < s.price
                    && current.close > s.price
                    && passes_size_filter(s.price, current.low, self.config.min_zone_pct)
            });
            if let Some(swing) = sweep_low {
                out.push(Candidate {
                    index: i,
                    direction: Direction::Bullish,
                    zone_high: swing.price,
                    zone_low: current.low,
                });
            }

            let sweep_high = self.eligible(&highs, i).find(|s| {
                current.high > s.price
                    && current.close < s.price
                    && passes_size_filter(current.high, s.price, self.config.min_zone_pct)
            });
            if let Some(swing) = sweep_high {
                out.push(Candidate {
                    index: i,
                    direction: Direction::Bearish,
                    zone_high: current.high,
                    zone_low: swing.price,
                });
            }
        }
        out
    }
}
