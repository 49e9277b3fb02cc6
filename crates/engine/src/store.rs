//! Storage seams and their SQLite implementations
//!
//! The orchestrator reads candles and production zones through
//! `CandleSource` / `PatternStore` and is the only caller of `RunStore`
//! writes. Records keep decimals as text; conversions live here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persistence::repository::{
    CandleRecord, CandleRepository, JobRecord, JobRepository, JobUpdate, NewJob,
    PatternRepository, ProductionPatternRecord, RunFilter, RunRecord, RunRepository,
};
use persistence::{now_rfc3339, SqlitePool};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::job::{
    JobId, OptimizationJob, OptimizationRun, RunArena, RunFailure, RunId, RunStatus,
};
use crate::params::SimulationParameters;
use crate::statistics::{Metric, Statistics};
use crate::types::{Candle, Direction, PatternType, PatternZone, Scope, Timeframe, ZoneContext};
use crate::worker::RunState;

#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles with `start <= timestamp <= end`, deduplicated and time ordered
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> EngineResult<Vec<Candle>>;
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn get_zones(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        pattern_type: PatternType,
        start: i64,
        end: i64,
    ) -> EngineResult<Vec<PatternZone>>;
}

/// Filter over completed runs
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub job_id: Option<JobId>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub pattern_type: Option<PatternType>,
    pub min_trades: u32,
}

impl RunQuery {
    pub fn for_scope(scope: &Scope) -> Self {
        Self {
            symbol: Some(scope.symbol.clone()),
            timeframe: Some(scope.timeframe),
            pattern_type: Some(scope.pattern_type),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new job with all its runs pending; returns the assigned id
    async fn create_job(&self, job: &OptimizationJob, runs: &RunArena) -> EngineResult<JobId>;

    async fn load_job(&self, id: JobId) -> EngineResult<(OptimizationJob, RunArena)>;

    async fn update_job(&self, job: &OptimizationJob) -> EngineResult<()>;

    /// Write a batch of runs atomically
    async fn save_runs(&self, job_id: JobId, runs: &[OptimizationRun]) -> EngineResult<()>;

    async fn completed_runs(&self, query: &RunQuery) -> EngineResult<Vec<OptimizationRun>>;

    /// Most recently updated completed run, in any job, whose stored scope
    /// and parameters are exactly these
    async fn latest_completed(
        &self,
        scope: &Scope,
        params: &SimulationParameters,
    ) -> EngineResult<Option<OptimizationRun>>;

    async fn list_jobs(&self, limit: usize) -> EngineResult<Vec<OptimizationJob>>;
}

// ============================================================================
// SQLite implementations
// ============================================================================

#[derive(Clone)]
pub struct SqliteCandleSource {
    pool: SqlitePool,
}

impl SqliteCandleSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandleSource for SqliteCandleSource {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> EngineResult<Vec<Candle>> {
        let repo = CandleRepository::new(&self.pool);
        let records = repo.get_range(symbol, timeframe.as_str(), start, end).await?;
        records.iter().map(record_to_candle).collect()
    }
}

#[derive(Clone)]
pub struct SqlitePatternStore {
    pool: SqlitePool,
}

impl SqlitePatternStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PatternStore for SqlitePatternStore {
    async fn get_zones(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        pattern_type: PatternType,
        start: i64,
        end: i64,
    ) -> EngineResult<Vec<PatternZone>> {
        let repo = PatternRepository::new(&self.pool);
        let records = repo
            .get_range(symbol, timeframe.as_str(), pattern_type.as_str(), start, end)
            .await?;
        records.iter().map(record_to_zone).collect()
    }
}

#[derive(Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
    /// Closed trades kept per run record
    trade_retention: usize,
}

impl SqliteRunStore {
    pub fn new(pool: SqlitePool, trade_retention: usize) -> Self {
        Self {
            pool,
            trade_retention,
        }
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_job(&self, job: &OptimizationJob, runs: &RunArena) -> EngineResult<JobId> {
        let new_job = NewJob {
            name: job.name.clone(),
            scope_json: serde_json::to_string(&job.scope_set)?,
            grid_json: serde_json::to_string(&job.grid)?,
            metric: job.metric.as_str().to_string(),
        };
        let records = runs
            .iter()
            .map(|run| run_to_record(0, run, self.trade_retention))
            .collect::<EngineResult<Vec<_>>>()?;
        let id = JobRepository::new(&self.pool).create(&new_job, &records).await?;
        Ok(id)
    }

    async fn load_job(&self, id: JobId) -> EngineResult<(OptimizationJob, RunArena)> {
        let record = JobRepository::new(&self.pool)
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {id}")))?;
        let mut job = record_to_job(record)?;

        let mut arena = RunArena::new();
        for run in RunRepository::new(&self.pool).list_for_job(id).await? {
            arena.push(record_to_run(RunId(0), run)?);
        }
        job.run_ids = arena.iter().map(|r| r.id).collect();
        Ok((job, arena))
    }

    async fn update_job(&self, job: &OptimizationJob) -> EngineResult<()> {
        let update = JobUpdate {
            status: job.status.as_str().to_string(),
            scope_json: Some(serde_json::to_string(&job.scope_set)?),
            completed_runs: job.completed_runs as i64,
            failed_runs: job.failed_runs as i64,
            best_params_json: job.best_params.as_ref().map(serde_json::to_string).transpose()?,
            best_run_key: job.best_run_key.clone(),
            error_message: job.error.clone(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        };
        JobRepository::new(&self.pool).update(job.id, &update).await?;
        Ok(())
    }

    async fn save_runs(&self, job_id: JobId, runs: &[OptimizationRun]) -> EngineResult<()> {
        let records = runs
            .iter()
            .map(|run| run_to_record(job_id, run, self.trade_retention))
            .collect::<EngineResult<Vec<_>>>()?;
        RunRepository::new(&self.pool).save_batch(&records).await?;
        Ok(())
    }

    async fn completed_runs(&self, query: &RunQuery) -> EngineResult<Vec<OptimizationRun>> {
        let filter = RunFilter {
            job_id: query.job_id,
            symbol: query.symbol.clone(),
            timeframe: query.timeframe.map(|tf| tf.as_str().to_string()),
            pattern_type: query.pattern_type.map(|p| p.as_str().to_string()),
            min_trades: i64::from(query.min_trades),
        };
        let records = RunRepository::new(&self.pool).completed(&filter).await?;
        records
            .into_iter()
            .enumerate()
            .map(|(i, r)| record_to_run(RunId(i), r))
            .collect()
    }

    async fn latest_completed(
        &self,
        scope: &Scope,
        params: &SimulationParameters,
    ) -> EngineResult<Option<OptimizationRun>> {
        let records = RunRepository::new(&self.pool)
            .completed_in_range(
                &scope.symbol,
                scope.timeframe.as_str(),
                scope.pattern_type.as_str(),
                scope.start,
                scope.end,
            )
            .await?;
        let wanted = params.canonical();
        for record in records {
            let run = record_to_run(RunId(0), record)?;
            if run.params.canonical() == wanted {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    async fn list_jobs(&self, limit: usize) -> EngineResult<Vec<OptimizationJob>> {
        let records = JobRepository::new(&self.pool).list(limit as i64).await?;
        records.into_iter().map(record_to_job).collect()
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn parse_dec(field: &str, s: &str) -> EngineResult<Decimal> {
    Decimal::from_str_exact(s)
        .or_else(|_| Decimal::from_str(s))
        .map_err(|e| EngineError::Storage(format!("bad decimal in {field}: '{s}' ({e})")))
}

fn parse_time(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("bad timestamp '{s}': {e}")))
}

pub fn candle_to_record(symbol: &str, timeframe: Timeframe, candle: &Candle) -> CandleRecord {
    CandleRecord {
        symbol: symbol.to_string(),
        timeframe: timeframe.as_str().to_string(),
        timestamp: candle.timestamp,
        open: candle.open.to_string(),
        high: candle.high.to_string(),
        low: candle.low.to_string(),
        close: candle.close.to_string(),
        volume: candle.volume.to_string(),
    }
}

fn record_to_candle(record: &CandleRecord) -> EngineResult<Candle> {
    Ok(Candle {
        timestamp: record.timestamp,
        open: parse_dec("open", &record.open)?,
        high: parse_dec("high", &record.high)?,
        low: parse_dec("low", &record.low)?,
        close: parse_dec("close", &record.close)?,
        volume: parse_dec("volume", &record.volume)?,
    })
}

pub fn zone_to_record(symbol: &str, timeframe: Timeframe, zone: &PatternZone) -> ProductionPatternRecord {
    let has_context = zone.context != ZoneContext::default();
    ProductionPatternRecord {
        id: None,
        symbol: symbol.to_string(),
        timeframe: timeframe.as_str().to_string(),
        pattern_type: zone.pattern_type.as_str().to_string(),
        direction: zone.direction.as_str().to_string(),
        zone_high: zone.zone_high.to_string(),
        zone_low: zone.zone_low.to_string(),
        detected_at: zone.detected_at,
        context_json: has_context
            .then(|| serde_json::to_string(&zone.context).ok())
            .flatten(),
    }
}

fn record_to_zone(record: &ProductionPatternRecord) -> EngineResult<PatternZone> {
    let context = match &record.context_json {
        Some(json) => serde_json::from_str(json)?,
        None => ZoneContext::default(),
    };
    let zone = PatternZone {
        pattern_type: record
            .pattern_type
            .parse()
            .map_err(|e: EngineError| EngineError::Data(e.to_string()))?,
        direction: Direction::from_str(&record.direction)?,
        zone_high: parse_dec("zone_high", &record.zone_high)?,
        zone_low: parse_dec("zone_low", &record.zone_low)?,
        detected_at: record.detected_at,
        context,
    };
    if zone.zone_high < zone.zone_low {
        return Err(EngineError::Data(format!(
            "production zone {} has high below low",
            zone.reference()
        )));
    }
    Ok(zone)
}

fn record_to_job(record: JobRecord) -> EngineResult<OptimizationJob> {
    Ok(OptimizationJob {
        id: record.id,
        name: record.name,
        status: record.status.parse()?,
        scope_set: serde_json::from_str(&record.scope_json)?,
        grid: serde_json::from_str(&record.grid_json)?,
        metric: Metric::from_str(&record.metric)
            .map_err(|e| EngineError::Storage(e.to_string()))?,
        run_ids: Vec::new(),
        total_runs: record.total_runs as usize,
        completed_runs: record.completed_runs as usize,
        failed_runs: record.failed_runs as usize,
        best_params: record
            .best_params_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        best_run_key: record.best_run_key,
        error: record.error_message,
        created_at: parse_time(&record.created_at)?,
        started_at: record.started_at.as_deref().map(parse_time).transpose()?,
        finished_at: record.finished_at.as_deref().map(parse_time).transpose()?,
    })
}

fn run_to_record(job_id: JobId, run: &OptimizationRun, retention: usize) -> EngineResult<RunRecord> {
    let stats = &run.statistics;
    let kept = &run.trades[run.trades.len().saturating_sub(retention)..];
    Ok(RunRecord {
        id: None,
        job_id,
        run_key: run.run_key.clone(),
        symbol: run.scope.symbol.clone(),
        timeframe: run.scope.timeframe.as_str().to_string(),
        pattern_type: run.scope.pattern_type.as_str().to_string(),
        start_ts: run.scope.start,
        end_ts: run.scope.end,
        params_json: serde_json::to_string(&run.params)?,
        // in-flight runs are only ever persisted as pending
        status: match run.status {
            RunStatus::Running => RunStatus::Pending.as_str().to_string(),
            status => status.as_str().to_string(),
        },
        total_trades: i64::from(stats.total_trades),
        wins: i64::from(stats.wins),
        losses: i64::from(stats.losses),
        expired: i64::from(stats.expired),
        win_rate: stats.win_rate.to_string(),
        avg_rr: stats.avg_rr.to_string(),
        total_profit_pct: stats.total_profit_pct.to_string(),
        max_drawdown: stats.max_drawdown.to_string(),
        sharpe_ratio: stats.sharpe_ratio.to_string(),
        profit_factor: stats.profit_factor.to_string(),
        avg_duration: stats.avg_duration.to_string(),
        stats_state_json: serde_json::to_string(&run.state.stats)?,
        trades_json: serde_json::to_string(kept)?,
        open_trades_json: serde_json::to_string(&run.state.open_trades)?,
        pending_entries_json: serde_json::to_string(&run.state.pending)?,
        last_candle_ts: run.state.checkpoint,
        invocations: i64::from(run.state.invocations),
        error_kind: run.error.as_ref().map(|e| e.kind.clone()),
        error_message: run.error.as_ref().map(|e| e.message.clone()),
        updated_at: now_rfc3339(),
    })
}

fn record_to_run(id: RunId, record: RunRecord) -> EngineResult<OptimizationRun> {
    let statistics = Statistics {
        total_trades: record.total_trades as u32,
        wins: record.wins as u32,
        losses: record.losses as u32,
        expired: record.expired as u32,
        win_rate: parse_dec("win_rate", &record.win_rate)?,
        avg_rr: parse_dec("avg_rr", &record.avg_rr)?,
        total_profit_pct: parse_dec("total_profit_pct", &record.total_profit_pct)?,
        max_drawdown: parse_dec("max_drawdown", &record.max_drawdown)?,
        sharpe_ratio: parse_dec("sharpe_ratio", &record.sharpe_ratio)?,
        profit_factor: parse_dec("profit_factor", &record.profit_factor)?,
        avg_duration: parse_dec("avg_duration", &record.avg_duration)?,
    };

    let state = RunState {
        checkpoint: record.last_candle_ts,
        open_trades: serde_json::from_str(&record.open_trades_json)?,
        pending: serde_json::from_str(&record.pending_entries_json)?,
        stats: serde_json::from_str(&record.stats_state_json)?,
        invocations: record.invocations as u32,
    };

    let error = record.error_message.map(|message| RunFailure {
        kind: record.error_kind.unwrap_or_else(|| "unknown".to_string()),
        message,
    });

    Ok(OptimizationRun {
        id,
        run_key: record.run_key,
        scope: Scope {
            symbol: record.symbol,
            timeframe: record
                .timeframe
                .parse()
                .map_err(|e: EngineError| EngineError::Storage(e.to_string()))?,
            pattern_type: record
                .pattern_type
                .parse()
                .map_err(|e: EngineError| EngineError::Storage(e.to_string()))?,
            start: record.start_ts,
            end: record.end_ts,
        },
        params: serde_json::from_str(&record.params_json)?,
        status: RunStatus::from_str(&record.status)?,
        statistics,
        trades: serde_json::from_str(&record.trades_json)?,
        state,
        error,
    })
}
