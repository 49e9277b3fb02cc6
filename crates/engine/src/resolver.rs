//! Carry-over resolution
//!
//! Trades left open (and entries still pending) at the end of one invocation
//! are advanced over the candles that arrived since, before any new
//! detection runs. Candles at or before the run's checkpoint were already
//! examined and are skipped, so resolving twice over the same window is a
//! no-op.

use tracing::debug;

use crate::error::EngineError;
use crate::simulator::{SimulationOutcome, Simulator};
use crate::trade::{PendingEntry, SimulatedTrade};
use crate::types::Candle;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: Vec<SimulatedTrade>,
    pub still_open: Vec<SimulatedTrade>,
    pub pending: Vec<PendingEntry>,
    /// Timestamp of the last candle examined
    pub checkpoint: Option<i64>,
}

/// Candles strictly after the checkpoint (the input is time-ordered)
pub fn unexamined(candles: &[Candle], checkpoint: Option<i64>) -> &[Candle] {
    match checkpoint {
        Some(ts) => &candles[candles.partition_point(|c| c.timestamp <= ts)..],
        None => candles,
    }
}

/// Advance open trades and pending entries over candles newer than `checkpoint`
pub fn resolve(
    simulator: &Simulator,
    open_trades: &[SimulatedTrade],
    pending: &[PendingEntry],
    new_candles: &[Candle],
    checkpoint: Option<i64>,
) -> Result<Resolution, EngineError> {
    let fresh = unexamined(new_candles, checkpoint);
    let Some(last) = fresh.last() else {
        return Ok(Resolution {
            resolved: Vec::new(),
            still_open: open_trades.to_vec(),
            pending: pending.to_vec(),
            checkpoint,
        });
    };

    let mut resolution = Resolution {
        checkpoint: Some(last.timestamp),
        ..Default::default()
    };

    for trade in open_trades {
        let advanced = simulator.advance(trade.clone(), fresh)?;
        if advanced.is_open() {
            resolution.still_open.push(advanced);
        } else {
            resolution.resolved.push(advanced);
        }
    }

    let mut dropped = 0usize;
    for entry in pending {
        match simulator.resume_pending(entry, fresh)? {
            SimulationOutcome::NotTriggered => dropped += 1,
            SimulationOutcome::AwaitingEntry(still_waiting) => resolution.pending.push(still_waiting),
            SimulationOutcome::Traded(trade) if trade.is_open() => resolution.still_open.push(trade),
            SimulationOutcome::Traded(trade) => resolution.resolved.push(trade),
        }
    }

    debug!(
        candles = fresh.len(),
        resolved = resolution.resolved.len(),
        still_open = resolution.still_open.len(),
        pending = resolution.pending.len(),
        dropped,
        "Resolved carried-over trades"
    );

    Ok(resolution)
}
