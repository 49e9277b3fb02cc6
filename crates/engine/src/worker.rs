//! Run execution
//!
//! `execute_run` is the one function that evaluates a parameter set over a
//! scope. The orchestrator calls it from the blocking pool for every Run and
//! the CLI backtest calls it directly; nothing here touches storage.
//!
//! A run carries a `RunState` between invocations: the last candle examined,
//! trades still open, entries still pending and the statistics accumulator.
//! Each invocation resolves the carried state over unexamined candles first,
//! then simulates only zones detected after the checkpoint, so splitting a
//! date range into several invocations closes exactly the same trades as one
//! invocation over the whole range.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::{DetectorConfig, EngineConfig};
use crate::detector;
use crate::error::EngineError;
use crate::params::SimulationParameters;
use crate::resolver;
use crate::simulator::{IntrabarSeries, SimulationOutcome, Simulator};
use crate::statistics::{StatsAccumulator, Statistics};
use crate::trade::{sort_and_dedup, PendingEntry, SimulatedTrade};
use crate::types::{Candle, PatternZone, Scope};

/// Zones checked between deadline polls
const DEADLINE_POLL_EVERY: usize = 64;

/// Where a run takes its zones from
#[derive(Debug, Clone)]
pub enum ZoneSource {
    /// Run the scope's detector over the candles
    Detect(DetectorConfig),
    /// Zones computed once and shared across runs (or loaded from production)
    Provided(Arc<[PatternZone]>),
}

/// State carried from one invocation of a run to the next
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Timestamp of the last candle examined
    pub checkpoint: Option<i64>,
    pub open_trades: Vec<SimulatedTrade>,
    pub pending: Vec<PendingEntry>,
    pub stats: StatsAccumulator,
    pub invocations: u32,
}

#[derive(Debug, Clone)]
pub struct RunInput {
    pub scope: Scope,
    pub params: SimulationParameters,
    /// Candles for the scope's symbol and timeframe, time ordered
    pub candles: Arc<[Candle]>,
    pub zones: ZoneSource,
    pub state: RunState,
    pub simulator: Simulator,
    pub deadline: Option<Instant>,
    /// Reported in the timeout error
    pub budget_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    /// Trades closed during this invocation, chronological
    pub closed: Vec<SimulatedTrade>,
    pub statistics: Statistics,
    pub zones_evaluated: usize,
    /// No candles newer than the checkpoint were available
    pub up_to_date: bool,
}

/// Simulator for a scope, with intrabar data when replay is enabled
pub fn build_simulator(
    scope: &Scope,
    config: &EngineConfig,
    intrabar: Option<Arc<IntrabarSeries>>,
) -> Simulator {
    let intrabar = if config.intrabar_replay { intrabar } else { None };
    Simulator::new(scope.timeframe, config.entry_window_candles).with_intrabar(intrabar)
}

/// Resolve carried trades, then detect and simulate zones newer than the checkpoint
pub fn execute_run(input: &RunInput) -> Result<RunOutcome, EngineError> {
    let scope = &input.scope;
    input.params.validate()?;

    let candles = in_scope(&input.candles, scope);
    if !candles.iter().any(Candle::is_well_formed) {
        return Err(EngineError::Data(format!(
            "no usable candles for {} {} in range",
            scope.symbol, scope.timeframe
        )));
    }

    let prior = &input.state;
    let fresh = resolver::unexamined(candles, prior.checkpoint);
    if fresh.is_empty() {
        return Ok(RunOutcome {
            statistics: prior.stats.finalize(),
            state: RunState {
                invocations: prior.invocations + 1,
                ..prior.clone()
            },
            closed: Vec::new(),
            zones_evaluated: 0,
            up_to_date: true,
        });
    }

    let resolution = resolver::resolve(
        &input.simulator,
        &prior.open_trades,
        &prior.pending,
        candles,
        prior.checkpoint,
    )?;
    check_deadline(input)?;

    let zones = new_zones(input, candles, prior.checkpoint);
    let mut closed = resolution.resolved;
    let mut open_trades = resolution.still_open;
    let mut pending = resolution.pending;

    for (i, zone) in zones.iter().enumerate() {
        if i % DEADLINE_POLL_EVERY == 0 {
            check_deadline(input)?;
        }
        match input.simulator.simulate(zone, candles, &input.params)? {
            SimulationOutcome::NotTriggered => {}
            SimulationOutcome::AwaitingEntry(entry) => pending.push(entry),
            SimulationOutcome::Traded(trade) if trade.is_open() => open_trades.push(trade),
            SimulationOutcome::Traded(trade) => closed.push(trade),
        }
    }

    sort_and_dedup(&mut closed);
    // order must not depend on where earlier invocations were split
    open_trades.sort_by(|a, b| {
        (a.entry_time, &a.pattern_ref).cmp(&(b.entry_time, &b.pattern_ref))
    });
    pending.sort_by_key(|p| (p.zone.detected_at, p.zone.reference()));

    let mut stats = prior.stats.clone();
    stats.extend(&closed);

    debug!(
        symbol = %scope.symbol,
        timeframe = %scope.timeframe,
        pattern = %scope.pattern_type,
        zones = zones.len(),
        closed = closed.len(),
        open = open_trades.len(),
        pending = pending.len(),
        "Run evaluated"
    );

    let statistics = stats.finalize();
    Ok(RunOutcome {
        state: RunState {
            checkpoint: resolution.checkpoint,
            open_trades,
            pending,
            stats,
            invocations: prior.invocations + 1,
        },
        closed,
        statistics,
        zones_evaluated: zones.len(),
        up_to_date: false,
    })
}

/// One-shot sequential backtest over a scope, detecting zones itself
pub fn run_backtest(
    scope: &Scope,
    params: &SimulationParameters,
    candles: Arc<[Candle]>,
    config: &EngineConfig,
    intrabar: Option<Arc<IntrabarSeries>>,
) -> Result<RunOutcome, EngineError> {
    let input = RunInput {
        scope: scope.clone(),
        params: params.clone(),
        candles,
        zones: ZoneSource::Detect(config.detector.clone()),
        state: RunState::default(),
        simulator: build_simulator(scope, config, intrabar),
        deadline: config.run_timeout().map(|budget| Instant::now() + budget),
        budget_secs: config.run_timeout_secs,
    };
    execute_run(&input)
}

fn in_scope<'a>(candles: &'a [Candle], scope: &Scope) -> &'a [Candle] {
    let lo = candles.partition_point(|c| c.timestamp < scope.start);
    let hi = candles.partition_point(|c| c.timestamp <= scope.end);
    &candles[lo..hi.max(lo)]
}

fn new_zones(input: &RunInput, candles: &[Candle], checkpoint: Option<i64>) -> Vec<PatternZone> {
    let is_new = |z: &PatternZone| checkpoint.map_or(true, |ts| z.detected_at > ts);
    match &input.zones {
        ZoneSource::Detect(config) => {
            let config = config.with_min_zone_pct(input.params.min_zone_pct);
            detector::detect(
                input.scope.pattern_type,
                &config,
                candles,
                !input.params.use_overlap_detection,
            )
            .into_iter()
            .filter(|z| is_new(z))
            .collect()
        }
        ZoneSource::Provided(zones) => {
            let (first, last) = match (candles.first(), candles.last()) {
                (Some(first), Some(last)) => (first.timestamp, last.timestamp),
                _ => return Vec::new(),
            };
            zones
                .iter()
                .filter(|z| z.pattern_type == input.scope.pattern_type)
                .filter(|z| z.detected_at >= first && z.detected_at <= last)
                .filter(|z| is_new(z))
                .cloned()
                .collect()
        }
    }
}

fn check_deadline(input: &RunInput) -> Result<(), EngineError> {
    match input.deadline {
        Some(deadline) if Instant::now() >= deadline => Err(EngineError::Timeout(input.budget_secs)),
        _ => Ok(()),
    }
}
