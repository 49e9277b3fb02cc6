//! Jobs and runs
//!
//! A job owns its runs through an index list into a `RunArena`; runs never
//! point back at their job. Status transitions go through `set_status`, which
//! rejects moves the state machines do not allow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;
use crate::grid::ParameterGrid;
use crate::params::SimulationParameters;
use crate::statistics::{Metric, Statistics};
use crate::trade::SimulatedTrade;
use crate::types::{Scope, ScopeSet};
use crate::worker::{RunOutcome, RunState};

pub type JobId = i64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Terminal jobs may be re-invoked, which sends them back to running
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            (current, JobStatus::Running) => current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(EngineError::Storage(format!("unknown job status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_advance_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Running, next) => next.is_terminal(),
            // incremental re-invocation
            (current, RunStatus::Running) => current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(EngineError::Storage(format!("unknown run status '{other}'"))),
        }
    }
}

/// Index of a run inside its job's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// `EngineError::kind`
    pub kind: String,
    pub message: String,
}

impl From<&EngineError> for RunFailure {
    fn from(e: &EngineError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// One parameter combination evaluated over one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationRun {
    pub id: RunId,
    pub run_key: String,
    pub scope: Scope,
    pub params: SimulationParameters,
    pub status: RunStatus,
    pub statistics: Statistics,
    /// Most recent closed trades, bounded by the engine's retention setting
    pub trades: Vec<SimulatedTrade>,
    pub state: RunState,
    pub error: Option<RunFailure>,
}

impl OptimizationRun {
    pub fn new(id: RunId, run_key: String, scope: Scope, params: SimulationParameters) -> Self {
        Self {
            id,
            run_key,
            scope,
            params,
            status: RunStatus::Pending,
            statistics: Statistics::default(),
            trades: Vec::new(),
            state: RunState::default(),
            error: None,
        }
    }

    pub fn set_status(&mut self, next: RunStatus) -> Result<(), EngineError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_advance_to(next) {
            return Err(EngineError::Simulation(format!(
                "run {} cannot move from {} to {}",
                self.run_key, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Failed runs start over on the next invocation
    pub fn needs_restart(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Fold a worker outcome into the run and mark it completed
    pub fn complete(&mut self, outcome: RunOutcome, retention: usize) -> Result<(), EngineError> {
        self.set_status(RunStatus::Completed)?;
        self.trades.extend(outcome.closed);
        if self.trades.len() > retention {
            let excess = self.trades.len() - retention;
            self.trades.drain(..excess);
        }
        self.state = outcome.state;
        self.statistics = outcome.statistics;
        self.error = None;
        Ok(())
    }

    /// Record the error and clear results; the run is recomputed next time
    pub fn fail(&mut self, error: &EngineError) -> Result<(), EngineError> {
        self.set_status(RunStatus::Failed)?;
        self.error = Some(RunFailure::from(error));
        self.statistics = Statistics::default();
        self.trades.clear();
        self.state = RunState::default();
        Ok(())
    }
}

/// Runs of one job, addressed by `RunId`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArena {
    runs: Vec<OptimizationRun>,
}

impl RunArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a run; its id is its position
    pub fn push(&mut self, mut run: OptimizationRun) -> RunId {
        let id = RunId(self.runs.len());
        run.id = id;
        self.runs.push(run);
        id
    }

    pub fn get(&self, id: RunId) -> Option<&OptimizationRun> {
        self.runs.get(id.0)
    }

    pub fn get_mut(&mut self, id: RunId) -> Option<&mut OptimizationRun> {
        self.runs.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptimizationRun> {
        self.runs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OptimizationRun> {
        self.runs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationJob {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub scope_set: ScopeSet,
    pub grid: ParameterGrid,
    pub metric: Metric,
    pub run_ids: Vec<RunId>,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub best_params: Option<SimulationParameters>,
    pub best_run_key: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl OptimizationJob {
    pub fn set_status(&mut self, next: JobStatus) -> Result<(), EngineError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_advance_to(next) {
            return Err(EngineError::Config(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Refresh the counters from the arena
    pub fn tally(&mut self, arena: &RunArena) {
        self.total_runs = arena.len();
        self.completed_runs = arena.count(RunStatus::Completed);
        self.failed_runs = arena.count(RunStatus::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{EntryMethod, TpMethod};
    use crate::types::{PatternType, Timeframe};
    use rust_decimal_macros::dec;

    fn run() -> OptimizationRun {
        OptimizationRun::new(
            RunId(0),
            "key".into(),
            Scope {
                symbol: "ETH/USDT".into(),
                timeframe: Timeframe::H4,
                pattern_type: PatternType::OrderBlock,
                start: 0,
                end: 1,
            },
            SimulationParameters {
                rr_target: dec!(2),
                sl_buffer_pct: dec!(10),
                min_zone_pct: dec!(0.15),
                entry_method: EntryMethod::ZoneEdge,
                tp_method: TpMethod::FixedRr,
                use_overlap_detection: true,
            },
        )
    }

    #[test]
    fn test_run_state_machine() {
        let mut r = run();
        assert!(r.set_status(RunStatus::Completed).is_err());
        r.set_status(RunStatus::Running).unwrap();
        r.set_status(RunStatus::Completed).unwrap();
        assert!(r.set_status(RunStatus::Pending).is_err());
        // re-invocation
        r.set_status(RunStatus::Running).unwrap();
        r.fail(&EngineError::Timeout(3)).unwrap();
        assert!(r.needs_restart());
        let failure = r.error.clone().unwrap();
        assert_eq!(failure.kind, "timeout");
        assert!(failure.message.contains("3s"));
    }

    #[test]
    fn test_job_state_machine() {
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_advance_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Cancelled));
        assert!(JobStatus::Failed.can_advance_to(JobStatus::Running));
        assert!(!JobStatus::Completed.can_advance_to(JobStatus::Failed));
        assert_eq!("cancelled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_complete_keeps_most_recent_trades() {
        use crate::trade::{TradeLevels, TradeResult};
        use crate::types::{Direction, PatternZone, ZoneContext};

        let zone = PatternZone {
            pattern_type: PatternType::Fvg,
            direction: Direction::Bullish,
            zone_high: dec!(100),
            zone_low: dec!(98),
            detected_at: 0,
            context: ZoneContext::default(),
        };
        let levels = TradeLevels {
            entry: dec!(100),
            stop_loss: dec!(97.8),
            take_profit: dec!(104.4),
        };
        let trades: Vec<SimulatedTrade> = (1..=5)
            .map(|t| {
                let mut trade = SimulatedTrade::opened(&zone, levels, t);
                trade.close(dec!(104.4), t + 1, TradeResult::Win);
                trade
            })
            .collect();

        let mut r = run();
        r.set_status(RunStatus::Running).unwrap();
        let outcome = RunOutcome {
            state: RunState::default(),
            closed: trades,
            statistics: Statistics::default(),
            zones_evaluated: 5,
            up_to_date: false,
        };
        r.complete(outcome, 3).unwrap();
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.trades.len(), 3);
        assert_eq!(r.trades[0].entry_time, 3);
    }

    #[test]
    fn test_arena_assigns_ids() {
        let mut arena = RunArena::new();
        let a = arena.push(run());
        let b = arena.push(run());
        assert_eq!((a, b), (RunId(0), RunId(1)));
        assert_eq!(arena.get(b).unwrap().id, RunId(1));
        assert_eq!(arena.count(RunStatus::Pending), 2);
    }
}
