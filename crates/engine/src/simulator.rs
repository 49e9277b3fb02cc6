//! Trade simulation
//!
//! Replays one pattern zone forward through candles: wait for the entry to
//! trigger, then scan for the stop-loss or take-profit. When a single candle
//! touches both levels the fallback order is fixed:
//!
//! 1. replay the finer-grained candles covering that candle, if supplied,
//!    and take whichever level a finer candle touches first on its own;
//! 2. otherwise (no finer data, a finer candle touching both, or none
//!    touching either) close the trade as a loss at the stop.
//!
//! Every function here is pure: same zone, candles and parameters in, same
//! outcome out.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use crate::error::EngineError;
use crate::params::{EntryMethod, SimulationParameters, TpMethod};
use crate::trade::{
    AmbiguityResolution, PendingEntry, SimulatedTrade, TradeLevels, TradeResult,
};
use crate::types::{Candle, Direction, PatternZone, Timeframe};

/// Fraction of ATR (or zone width) the volatility-buffered entry is moved toward price
const ENTRY_VOLATILITY_FRACTION: Decimal = dec!(0.25);

// ============================================================================
// Intrabar data
// ============================================================================

/// Finer-grained candles used to settle same-candle SL/TP touches
#[derive(Debug, Clone)]
pub struct IntrabarSeries {
    candles: Vec<Candle>,
}

impl IntrabarSeries {
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Self { candles }
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Candles whose open time lies in `[start, end)`
    pub fn within(&self, start: i64, end: i64) -> &[Candle] {
        let lo = self.candles.partition_point(|c| c.timestamp < start);
        let hi = self.candles.partition_point(|c| c.timestamp < end);
        &self.candles[lo..hi.max(lo)]
    }
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationOutcome {
    /// The entry window elapsed without price reaching the entry
    NotTriggered,
    /// Candles ran out before the entry triggered
    AwaitingEntry(PendingEntry),
    /// Entry triggered; the trade is closed or still open
    Traded(SimulatedTrade),
}

impl SimulationOutcome {
    pub fn trade(&self) -> Option<&SimulatedTrade> {
        match self {
            SimulationOutcome::Traded(trade) => Some(trade),
            _ => None,
        }
    }
}

// ============================================================================
// Levels
// ============================================================================

/// Entry, stop-loss and take-profit for a zone under a parameter set
pub fn compute_levels(
    zone: &PatternZone,
    params: &SimulationParameters,
) -> Result<TradeLevels, EngineError> {
    let width = zone.width();
    let volatility = zone.context.atr.filter(|v| *v > Decimal::ZERO).unwrap_or(width);
    let entry_push = volatility * ENTRY_VOLATILITY_FRACTION;
    let buffer = width * params.sl_buffer_pct / Decimal::ONE_HUNDRED;

    let (entry, stop_loss) = match zone.direction {
        Direction::Bullish => {
            let entry = match params.entry_method {
                EntryMethod::ZoneEdge => zone.zone_high,
                EntryMethod::ZoneMid => zone.midpoint(),
                EntryMethod::VolatilityBuffer => zone.zone_high + entry_push,
            };
            (entry, zone.zone_low - buffer)
        }
        Direction::Bearish => {
            let entry = match params.entry_method {
                EntryMethod::ZoneEdge => zone.zone_low,
                EntryMethod::ZoneMid => zone.midpoint(),
                EntryMethod::VolatilityBuffer => zone.zone_low - entry_push,
            };
            (entry, zone.zone_high + buffer)
        }
    };

    let risk = (entry - stop_loss).abs();
    let fixed_reward = risk * params.rr_target;
    let take_profit = match (zone.direction, params.tp_method) {
        (Direction::Bullish, TpMethod::FixedRr) => entry + fixed_reward,
        (Direction::Bearish, TpMethod::FixedRr) => entry - fixed_reward,
        (Direction::Bullish, TpMethod::Swing) => zone
            .context
            .swing_high
            .filter(|h| *h > entry)
            .unwrap_or(entry + fixed_reward),
        (Direction::Bearish, TpMethod::Swing) => zone
            .context
            .swing_low
            .filter(|l| *l < entry)
            .unwrap_or(entry - fixed_reward),
        (Direction::Bullish, TpMethod::VolatilityMultiple) => {
            entry + volatility * params.rr_target
        }
        (Direction::Bearish, TpMethod::VolatilityMultiple) => {
            entry - volatility * params.rr_target
        }
    };

    let levels = TradeLevels {
        entry,
        stop_loss,
        take_profit,
    };
    check_levels(zone.direction, &levels)?;
    Ok(levels)
}

/// `stop_loss < entry < take_profit` for longs, mirrored for shorts, all positive
pub fn check_levels(direction: Direction, levels: &TradeLevels) -> Result<(), EngineError> {
    let ordered = match direction {
        Direction::Bullish => {
            levels.stop_loss < levels.entry && levels.entry < levels.take_profit
        }
        Direction::Bearish => {
            levels.take_profit < levels.entry && levels.entry < levels.stop_loss
        }
    };
    let positive = levels.stop_loss > Decimal::ZERO && levels.take_profit > Decimal::ZERO;
    if ordered && positive {
        Ok(())
    } else {
        Err(EngineError::Simulation(format!(
            "invalid {} levels: entry {} stop {} target {}",
            direction.as_str(),
            levels.entry,
            levels.stop_loss,
            levels.take_profit
        )))
    }
}

// ============================================================================
// Simulator
// ============================================================================

/// Stateless trade replayer. Holds only limits and optional intrabar data,
/// so one instance can be shared by every zone in a run.
#[derive(Debug, Clone)]
pub struct Simulator {
    bar_ms: i64,
    max_duration: u32,
    entry_window: u32,
    intrabar: Option<Arc<IntrabarSeries>>,
}

impl Simulator {
    pub fn new(timeframe: Timeframe, entry_window: u32) -> Self {
        Self {
            bar_ms: timeframe.duration_ms(),
            max_duration: timeframe.max_trade_candles(),
            entry_window: entry_window.max(1),
            intrabar: None,
        }
    }

    pub fn with_max_duration(mut self, candles: u32) -> Self {
        self.max_duration = candles.max(1);
        self
    }

    pub fn with_intrabar(mut self, series: Option<Arc<IntrabarSeries>>) -> Self {
        self.intrabar = series.filter(|s| !s.is_empty());
        self
    }

    /// Replay `zone` through the candles that follow its detection.
    /// Candles at or before `zone.detected_at` are ignored.
    pub fn simulate(
        &self,
        zone: &PatternZone,
        candles: &[Candle],
        params: &SimulationParameters,
    ) -> Result<SimulationOutcome, EngineError> {
        let levels = compute_levels(zone, params)?;
        let pending = PendingEntry {
            zone: zone.clone(),
            levels,
            waited: 0,
        };
        let start = candles.partition_point(|c| c.timestamp <= zone.detected_at);
        self.resume_pending(&pending, &candles[start..])
    }

    /// Continue waiting for an entry over candles not yet examined
    pub fn resume_pending(
        &self,
        pending: &PendingEntry,
        candles: &[Candle],
    ) -> Result<SimulationOutcome, EngineError> {
        check_levels(pending.zone.direction, &pending.levels)?;
        let entry = pending.levels.entry;
        let mut waited = pending.waited;

        for (i, candle) in candles.iter().enumerate() {
            // malformed candles are skipped here as in detection
            if candle.timestamp <= pending.zone.detected_at || !candle.is_well_formed() {
                continue;
            }
            let triggered = match pending.zone.direction {
                Direction::Bullish => candle.low <= entry,
                Direction::Bearish => candle.high >= entry,
            };
            if triggered {
                let trade = SimulatedTrade::opened(&pending.zone, pending.levels, candle.timestamp);
                return Ok(SimulationOutcome::Traded(self.advance(trade, &candles[i + 1..])?));
            }
            waited += 1;
            if waited >= self.entry_window {
                return Ok(SimulationOutcome::NotTriggered);
            }
        }

        Ok(SimulationOutcome::AwaitingEntry(PendingEntry {
            zone: pending.zone.clone(),
            levels: pending.levels,
            waited,
        }))
    }

    /// Forward-scan an open trade over candles after its entry. Closed trades
    /// are returned unchanged.
    pub fn advance(
        &self,
        mut trade: SimulatedTrade,
        candles: &[Candle],
    ) -> Result<SimulatedTrade, EngineError> {
        if !trade.is_open() {
            return Ok(trade);
        }
        check_levels(trade.direction, &trade.levels())?;

        for candle in candles {
            if candle.timestamp <= trade.entry_time || !candle.is_well_formed() {
                continue;
            }
            trade.duration += 1;

            let (hit_sl, hit_tp) = touches(&trade, candle);
            match (hit_sl, hit_tp) {
                (true, true) => {
                    let (result, how) = self.settle_ambiguous(&trade, candle);
                    let exit = match result {
                        TradeResult::Win => trade.take_profit,
                        _ => trade.stop_loss,
                    };
                    trade.close(exit, candle.timestamp, result);
                    trade.ambiguity = Some(how);
                }
                (true, false) => trade.close(trade.stop_loss, candle.timestamp, TradeResult::Loss),
                (false, true) => trade.close(trade.take_profit, candle.timestamp, TradeResult::Win),
                (false, false) if trade.duration >= self.max_duration => {
                    trade.close(candle.close, candle.timestamp, TradeResult::Expired)
                }
                (false, false) => continue,
            }
            break;
        }
        Ok(trade)
    }

    fn settle_ambiguous(
        &self,
        trade: &SimulatedTrade,
        candle: &Candle,
    ) -> (TradeResult, AmbiguityResolution) {
        if let Some(series) = &self.intrabar {
            let window = series.within(candle.timestamp, candle.timestamp + self.bar_ms);
            for fine in window.iter().filter(|c| c.is_well_formed()) {
                match touches(trade, fine) {
                    (true, false) => return (TradeResult::Loss, AmbiguityResolution::IntrabarReplay),
                    (false, true) => return (TradeResult::Win, AmbiguityResolution::IntrabarReplay),
                    (true, true) => break,
                    (false, false) => {}
                }
            }
        }
        (TradeResult::Loss, AmbiguityResolution::ConservativeLoss)
    }
}

/// (stop-loss touched, take-profit touched)
fn touches(trade: &SimulatedTrade, candle: &Candle) -> (bool, bool) {
    match trade.direction {
        Direction::Bullish => (
            candle.low <= trade.stop_loss,
            candle.high >= trade.take_profit,
        ),
        Direction::Bearish => (
            candle.high >= trade.stop_loss,
            candle.low <= trade.take_profit,
        ),
    }
}
