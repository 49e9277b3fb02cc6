//! Zone Optimizer Engine: pattern detection, trade simulation and
//! parameter optimization over historical candles
//!
//! Provides:
//! - FVG, order-block and liquidity-sweep detectors
//! - A trade simulator with an explicit same-candle ambiguity policy
//! - Incremental run execution that carries open trades between invocations
//! - Grid expansion, statistics and best-parameter selection
//! - A job orchestrator with a bounded worker pool and a single storage writer

pub mod config;
pub mod detector;
pub mod error;
pub mod grid;
pub mod indicators;
pub mod job;
pub mod orchestrator;
pub mod params;
pub mod resolver;
pub mod selection;
pub mod simulator;
pub mod statistics;
pub mod store;
pub mod trade;
pub mod types;
pub mod worker;

// Re-exports for convenience
pub use config::{DetectorConfig, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use grid::ParameterGrid;
pub use job::{JobId, JobStatus, OptimizationJob, OptimizationRun, RunArena, RunId, RunStatus};
pub use orchestrator::{JobProgress, JobSummary, Orchestrator, ProgressSnapshot, RunJobOptions};
pub use params::{compute_run_key, EntryMethod, SimulationParameters, TpMethod};
pub use selection::{BestParams, ComparisonReport, Preferred};
pub use simulator::{IntrabarSeries, Simulator};
pub use statistics::{aggregate, Metric, Statistics};
pub use store::{
    CandleSource, PatternStore, RunQuery, RunStore, SqliteCandleSource, SqlitePatternStore,
    SqliteRunStore,
};
pub use trade::{SimulatedTrade, TradeResult, TradeStatus};
pub use types::*;
pub use worker::{execute_run, run_backtest, RunOutcome, RunState};
