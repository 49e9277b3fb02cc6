//! Job orchestration
//!
//! `run_job` fans a job's runs out to the blocking pool, bounded by a
//! semaphore of `max_workers` permits, one (symbol, timeframe) group at a
//! time so only one candle series is resident. Workers report over an mpsc
//! channel; the calling task is the only one that writes to the run store
//! and commits finished runs in batches.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, RwLock,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::detector;
use crate::error::{EngineError, EngineResult};
use crate::grid::{self, ParameterGrid};
use crate::job::{
    JobId, JobStatus, OptimizationJob, OptimizationRun, RunArena, RunFailure, RunId, RunStatus,
};
use crate::params::{compute_run_key, SimulationParameters};
use crate::selection::{
    select_best, top_runs, BestParams, ComparisonReport, ComparisonSide, RankedRun, StatsOrigin,
};
use crate::simulator::IntrabarSeries;
use crate::statistics::Metric;
use crate::store::{CandleSource, PatternStore, RunQuery, RunStore};
use crate::types::{Candle, PatternType, PatternZone, Scope, ScopeSet, Timeframe, ZoneSourceKind};
use crate::worker::{build_simulator, execute_run, run_backtest, RunInput, RunOutcome, RunState, ZoneSource};

/// Runs listed per ranking in a job summary
const SUMMARY_TOP_N: usize = 10;
/// Minimum trades for a run to appear in a summary ranking
const SUMMARY_MIN_TRADES: u32 = 5;
const SUMMARY_MAX_FAILURES: usize = 10;

// ============================================================================
// Progress
// ============================================================================

/// Shared progress tracker between the API/CLI and a running job
pub struct JobProgress {
    pub status: RwLock<JobStatus>,
    pub job_id: RwLock<Option<JobId>>,
    pub total: AtomicUsize,
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
    pub running: AtomicUsize,
    pub skipped: AtomicUsize,
    pub cancelled: AtomicBool,
    pub error_message: RwLock<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: JobStatus,
    pub job_id: Option<JobId>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub skipped: usize,
    pub progress_pct: f32,
    pub cancelled: bool,
    pub error_message: Option<String>,
}

impl JobProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(JobStatus::Pending),
            job_id: RwLock::new(None),
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            error_message: RwLock::new(None),
        }
    }

    /// Reset for a new invocation
    pub fn reset(&self, job_id: JobId, total: usize) {
        *self.status.write().unwrap() = JobStatus::Running;
        self.clear(job_id, total);
    }

    /// Claim the tracker for `job_id` in one step. Returns false, leaving the
    /// tracker untouched, while another invocation holds it; the caller
    /// releases it with `finish`.
    pub fn try_start(&self, job_id: JobId) -> bool {
        let mut status = self.status.write().unwrap();
        if *status == JobStatus::Running {
            return false;
        }
        *status = JobStatus::Running;
        drop(status);
        self.clear(job_id, 0);
        true
    }

    fn clear(&self, job_id: JobId, total: usize) {
        *self.job_id.write().unwrap() = Some(job_id);
        self.total.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.running.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.error_message.write().unwrap() = None;
    }

    /// Share of runs that reached a terminal state
    pub fn progress_pct(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), JobStatus::Running)
    }

    /// Stop scheduling further runs; in-flight runs finish
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn finish(&self, status: JobStatus, error: Option<String>) {
        *self.status.write().unwrap() = status;
        *self.error_message.write().unwrap() = error;
        self.cancelled.store(false, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            status: *self.status.read().unwrap(),
            job_id: *self.job_id.read().unwrap(),
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            progress_pct: self.progress_pct(),
            cancelled: self.is_cancelled(),
            error_message: self.error_message.read().unwrap().clone(),
        }
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Summaries
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRun {
    pub run_key: String,
    pub scope: Scope,
    pub params: SimulationParameters,
    pub error: RunFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub metric: Metric,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub pending_runs: usize,
    pub best_params: Option<SimulationParameters>,
    pub best_run_key: Option<String>,
    pub top_by_profit: Vec<RankedRun>,
    pub top_by_win_rate: Vec<RankedRun>,
    pub error: Option<String>,
    pub failures: Vec<FailedRun>,
}

impl JobSummary {
    fn new(job: &OptimizationJob, arena: &RunArena) -> Self {
        let failures = arena
            .iter()
            .filter(|r| r.status == RunStatus::Failed)
            .filter_map(|r| {
                r.error.clone().map(|error| FailedRun {
                    run_key: r.run_key.clone(),
                    scope: r.scope.clone(),
                    params: r.params.clone(),
                    error,
                })
            })
            .take(SUMMARY_MAX_FAILURES)
            .collect();

        Self {
            job_id: job.id,
            name: job.name.clone(),
            status: job.status,
            metric: job.metric,
            total_runs: arena.len(),
            completed_runs: arena.count(RunStatus::Completed),
            failed_runs: arena.count(RunStatus::Failed),
            pending_runs: arena.count(RunStatus::Pending) + arena.count(RunStatus::Running),
            best_params: job.best_params.clone(),
            best_run_key: job.best_run_key.clone(),
            top_by_profit: top_runs(
                arena.iter(),
                Metric::TotalProfitPct,
                SUMMARY_MIN_TRADES,
                SUMMARY_TOP_N,
            ),
            top_by_win_rate: top_runs(arena.iter(), Metric::WinRate, SUMMARY_MIN_TRADES, SUMMARY_TOP_N),
            error: job.error.clone(),
            failures,
        }
    }
}

/// Options for one invocation of a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunJobOptions {
    /// Extend the job's date range to this end timestamp
    pub end: Option<i64>,
}

// ============================================================================
// Worker plumbing
// ============================================================================

#[derive(Debug)]
enum WorkerEvent {
    Started(RunId),
    Finished(RunId, EngineResult<RunOutcome>),
    Skipped(RunId),
}

struct RunTask {
    id: RunId,
    scope: Scope,
    params: SimulationParameters,
    state: RunState,
}

/// Runs sharing one candle series
struct ScopeGroup {
    symbol: String,
    timeframe: Timeframe,
    start: i64,
    end: i64,
    tasks: Vec<RunTask>,
}

struct Dispatcher {
    config: Arc<EngineConfig>,
    candles: Arc<dyn CandleSource>,
    patterns: Option<Arc<dyn PatternStore>>,
    zone_source: ZoneSourceKind,
    progress: Arc<JobProgress>,
    /// Set by the writer when storage has failed for good
    halt: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    events: mpsc::Sender<WorkerEvent>,
}

type ZoneKey = (PatternType, Decimal, bool);

/// Candles for an on-demand comparison, with finer candles when available
type ScopeSeries = (Arc<[Candle]>, Option<Arc<IntrabarSeries>>);

impl Dispatcher {
    fn stopped(&self) -> bool {
        self.progress.is_cancelled() || self.halt.load(Ordering::Relaxed)
    }

    async fn send(&self, event: WorkerEvent) {
        // the writer only goes away once every sender is dropped
        let _ = self.events.send(event).await;
    }

    async fn run(self, groups: Vec<ScopeGroup>) {
        for group in groups {
            if self.stopped() {
                for task in &group.tasks {
                    self.send(WorkerEvent::Skipped(task.id)).await;
                }
                continue;
            }
            self.run_group(group).await;
        }
    }

    async fn run_group(&self, mut group: ScopeGroup) {
        let candles = match self.load_candles(&group).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(
                    symbol = %group.symbol,
                    timeframe = %group.timeframe,
                    runs = group.tasks.len(),
                    error = %e,
                    "Failing scope runs"
                );
                for task in group.tasks {
                    self.send(WorkerEvent::Finished(task.id, Err(e.clone()))).await;
                }
                return;
            }
        };
        let intrabar = self.load_intrabar(&group).await;

        let mut zone_cache: HashMap<ZoneKey, EngineResult<ZoneSource>> = HashMap::new();
        let mut workers = JoinSet::new();

        let tasks = std::mem::take(&mut group.tasks);
        for task in tasks {
            let key = (
                task.scope.pattern_type,
                task.params.min_zone_pct,
                task.params.use_overlap_detection,
            );
            if !zone_cache.contains_key(&key) {
                let zones = self.zones_for(&group, key, candles.clone()).await;
                zone_cache.insert(key, zones);
            }
            let zones = match zone_cache.get(&key) {
                Some(Ok(zones)) => zones.clone(),
                Some(Err(e)) => {
                    self.send(WorkerEvent::Finished(task.id, Err(e.clone()))).await;
                    continue;
                }
                None => continue,
            };

            let input = RunInput {
                simulator: build_simulator(&task.scope, &self.config, intrabar.clone()),
                scope: task.scope,
                params: task.params,
                candles: candles.clone(),
                zones,
                state: task.state,
                deadline: None,
                budget_secs: self.config.run_timeout_secs,
            };
            let id = task.id;
            let permits = self.permits.clone();
            let events = self.events.clone();
            let progress = self.progress.clone();
            let halt = self.halt.clone();
            let budget = self.config.run_timeout();

            workers.spawn(async move {
                let Ok(permit) = permits.acquire_owned().await else {
                    return;
                };
                if progress.is_cancelled() || halt.load(Ordering::Relaxed) {
                    let _ = events.send(WorkerEvent::Skipped(id)).await;
                    return;
                }
                let _ = events.send(WorkerEvent::Started(id)).await;
                let result = execute_with_budget(input, permit, budget).await;
                let _ = events.send(WorkerEvent::Finished(id, result)).await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Run task aborted");
            }
        }
    }

    async fn load_candles(&self, group: &ScopeGroup) -> EngineResult<Arc<[Candle]>> {
        let candles = with_retry(&self.config, "get_candles", || {
            self.candles
                .get_candles(&group.symbol, group.timeframe, group.start, group.end)
        })
        .await?;

        if candles.len() < self.config.min_candles {
            return Err(EngineError::Data(format!(
                "{} {}: {} candles, need at least {}",
                group.symbol,
                group.timeframe,
                candles.len(),
                self.config.min_candles
            )));
        }
        debug!(symbol = %group.symbol, timeframe = %group.timeframe, candles = candles.len(), "Candles loaded");
        Ok(Arc::from(candles))
    }

    async fn load_intrabar(&self, group: &ScopeGroup) -> Option<Arc<IntrabarSeries>> {
        load_intrabar(
            &self.config,
            self.candles.as_ref(),
            &group.symbol,
            group.timeframe,
            group.start,
            group.end,
        )
        .await
    }

    /// Zones shared by every run with the same detection inputs
    async fn zones_for(
        &self,
        group: &ScopeGroup,
        (pattern_type, min_zone_pct, use_overlap): ZoneKey,
        candles: Arc<[Candle]>,
    ) -> EngineResult<ZoneSource> {
        let zones: Vec<PatternZone> = match self.zone_source {
            ZoneSourceKind::Replay => {
                let config = self.config.detector.with_min_zone_pct(min_zone_pct);
                tokio::task::spawn_blocking(move || {
                    detector::detect(pattern_type, &config, &candles, !use_overlap)
                })
                .await
                .map_err(|e| EngineError::Simulation(format!("detector panicked: {e}")))?
            }
            ZoneSourceKind::Production => {
                let store = self.patterns.as_ref().ok_or_else(|| {
                    EngineError::Config("production zones requested without a pattern store".into())
                })?;
                let zones = with_retry(&self.config, "get_zones", || {
                    store.get_zones(&group.symbol, group.timeframe, pattern_type, group.start, group.end)
                })
                .await?;
                zones
                    .into_iter()
                    .filter(|z| z.width_pct() >= min_zone_pct)
                    .collect()
            }
        };
        debug!(
            symbol = %group.symbol,
            timeframe = %group.timeframe,
            pattern = %pattern_type,
            %min_zone_pct,
            zones = zones.len(),
            "Zones prepared"
        );
        Ok(ZoneSource::Provided(Arc::from(zones)))
    }
}

/// Finer candles for same-candle ambiguity; missing data only disables replay
async fn load_intrabar(
    config: &EngineConfig,
    source: &dyn CandleSource,
    symbol: &str,
    timeframe: Timeframe,
    start: i64,
    end: i64,
) -> Option<Arc<IntrabarSeries>> {
    if !config.intrabar_replay {
        return None;
    }
    let finer = timeframe.finer()?;
    let end = end.saturating_add(timeframe.duration_ms());
    match source.get_candles(symbol, finer, start, end).await {
        Ok(candles) if !candles.is_empty() => Some(Arc::new(IntrabarSeries::new(candles))),
        Ok(_) => None,
        Err(e) => {
            warn!(symbol, timeframe = %finer, error = %e, "Intrabar candles unavailable");
            None
        }
    }
}

/// Run on the blocking pool under the wall-clock budget. The permit is held
/// until the worker thread returns, even after a timeout is reported.
async fn execute_with_budget(
    mut input: RunInput,
    permit: OwnedSemaphorePermit,
    budget: Option<Duration>,
) -> EngineResult<RunOutcome> {
    input.deadline = budget.map(|b| Instant::now() + b);
    let budget_secs = input.budget_secs;
    let handle = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        execute_run(&input)
    });

    let joined = match budget {
        Some(budget) => match tokio::time::timeout(budget, handle).await {
            Ok(joined) => joined,
            Err(_) => return Err(EngineError::Timeout(budget_secs)),
        },
        None => handle.await,
    };
    joined.map_err(|e| EngineError::Simulation(format!("worker panicked: {e}")))?
}

/// Retry storage failures with exponential backoff; other errors return at once
async fn with_retry<T, F, Fut>(config: &EngineConfig, operation: &str, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let attempts = config.store_retry_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e @ EngineError::Storage(_)) if attempt < attempts => {
                let delay = config.store_backoff(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Storage operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    candles: Arc<dyn CandleSource>,
    store: Arc<dyn RunStore>,
    patterns: Option<Arc<dyn PatternStore>>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, candles: Arc<dyn CandleSource>, store: Arc<dyn RunStore>) -> Self {
        Self {
            config: Arc::new(config),
            candles,
            store,
            patterns: None,
        }
    }

    pub fn with_pattern_store(mut self, patterns: Arc<dyn PatternStore>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate, expand and persist a job with every run pending
    pub async fn create_job(
        &self,
        name: &str,
        scope_set: ScopeSet,
        grid: ParameterGrid,
        metric: Metric,
    ) -> EngineResult<JobId> {
        scope_set.validate()?;
        let combinations = grid::expand(&grid)?;
        let scopes = scope_set.scopes();

        let total = scopes.len() * combinations.len();
        if total > self.config.max_runs_per_job {
            return Err(EngineError::Config(format!(
                "job expands to {total} runs, limit is {}",
                self.config.max_runs_per_job
            )));
        }
        if scope_set.zone_source == ZoneSourceKind::Production && self.patterns.is_none() {
            return Err(EngineError::Config(
                "production zones requested without a pattern store".into(),
            ));
        }

        let mut arena = RunArena::new();
        for scope in &scopes {
            for params in &combinations {
                let key = compute_run_key(scope, params);
                arena.push(OptimizationRun::new(RunId(0), key, scope.clone(), params.clone()));
            }
        }

        let job = OptimizationJob {
            id: 0,
            name: name.to_string(),
            status: JobStatus::Pending,
            scope_set,
            grid,
            metric,
            run_ids: arena.iter().map(|r| r.id).collect(),
            total_runs: arena.len(),
            completed_runs: 0,
            failed_runs: 0,
            best_params: None,
            best_run_key: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let id = with_retry(&self.config, "create_job", || self.store.create_job(&job, &arena)).await?;
        info!(job_id = id, name, runs = arena.len(), scopes = scopes.len(), "Job created");
        Ok(id)
    }

    /// Execute every run of a job, continuing completed runs from their
    /// checkpoints and restarting failed ones. Blocks until the job reaches
    /// a terminal state; poll `progress` for live counters.
    pub async fn run_job(
        &self,
        job_id: JobId,
        options: RunJobOptions,
        progress: Arc<JobProgress>,
    ) -> EngineResult<JobSummary> {
        let (mut job, mut arena) =
            with_retry(&self.config, "load_job", || self.store.load_job(job_id)).await?;

        if let Some(end) = options.end {
            if end < job.scope_set.end {
                return Err(EngineError::Config(format!(
                    "job {job_id} already covers up to {}, cannot shrink to {end}",
                    job.scope_set.end
                )));
            }
            job.scope_set.end = end;
            for run in arena.iter_mut() {
                run.scope.end = end;
            }
        }
        if job.scope_set.zone_source == ZoneSourceKind::Production && self.patterns.is_none() {
            return Err(EngineError::Config(
                "production zones requested without a pattern store".into(),
            ));
        }
        if job.status == JobStatus::Running {
            warn!(job_id, "Job was left running, resuming");
        }

        job.set_status(JobStatus::Running)?;
        job.started_at.get_or_insert_with(Utc::now);
        job.finished_at = None;
        job.error = None;
        progress.reset(job_id, arena.len());
        with_retry(&self.config, "update_job", || self.store.update_job(&job)).await?;

        info!(
            job_id,
            runs = arena.len(),
            end = job.scope_set.end,
            workers = self.config.max_workers,
            "Job started"
        );

        let (tx, mut rx) = mpsc::channel(self.config.max_workers.max(1) * 4);
        let halt = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            config: self.config.clone(),
            candles: self.candles.clone(),
            patterns: self.patterns.clone(),
            zone_source: job.scope_set.zone_source,
            progress: progress.clone(),
            halt: halt.clone(),
            permits: Arc::new(Semaphore::new(self.config.max_workers.max(1))),
            events: tx,
        };
        let dispatch = tokio::spawn(dispatcher.run(group_runs(&arena)));

        let mut writer = Writer {
            config: self.config.as_ref(),
            store: self.store.as_ref(),
            job_id,
            dirty: Vec::new(),
            storage_error: None,
            halt,
        };

        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Started(id) => {
                    if let Some(run) = arena.get_mut(id) {
                        match run.set_status(RunStatus::Running) {
                            Ok(()) => {
                                progress.running.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => error!(job_id, run = %run.run_key, error = %e, "Bad run transition"),
                        }
                    }
                }
                WorkerEvent::Skipped(_) => {
                    progress.skipped.fetch_add(1, Ordering::Relaxed);
                }
                WorkerEvent::Finished(id, result) => {
                    let Some(run) = arena.get_mut(id) else {
                        continue;
                    };
                    if run.status == RunStatus::Running {
                        progress.running.fetch_sub(1, Ordering::Relaxed);
                    }
                    if record_result(run, result, self.config.trade_retention) {
                        progress.completed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        progress.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    writer.dirty.push(id);
                    if writer.dirty.len() >= self.config.batch_size.max(1) {
                        writer.commit(&arena).await;
                    }
                }
            }
        }

        if let Err(e) = dispatch.await {
            error!(job_id, error = %e, "Dispatcher aborted");
        }

        // anything still running lost its worker
        for run in arena.iter_mut().filter(|r| r.status == RunStatus::Running) {
            let lost = EngineError::Simulation("worker exited without reporting".into());
            if run.fail(&lost).is_ok() {
                progress.running.fetch_sub(1, Ordering::Relaxed);
                progress.failed.fetch_add(1, Ordering::Relaxed);
                writer.dirty.push(run.id);
            }
        }
        writer.commit(&arena).await;

        job.tally(&arena);
        let best = select_best(arena.iter(), job.metric, self.config.min_trades);
        job.best_run_key = best.as_ref().map(|b| b.run_key.clone());
        job.best_params = best.map(|b| b.params);

        let status = if progress.is_cancelled() {
            JobStatus::Cancelled
        } else if let Some(e) = &writer.storage_error {
            job.error = Some(format!("run results could not be saved: {e}"));
            JobStatus::Failed
        } else if job.total_runs > 0 && job.failed_runs == job.total_runs {
            job.error = Some(format!("all {} runs failed", job.total_runs));
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        job.set_status(status)?;
        job.finished_at = Some(Utc::now());

        if let Err(e) = with_retry(&self.config, "update_job", || self.store.update_job(&job)).await {
            error!(job_id, error = %e, "Could not record job outcome");
            progress.finish(JobStatus::Failed, Some(e.to_string()));
            return Err(e);
        }
        progress.finish(status, job.error.clone());

        info!(
            job_id,
            status = %status,
            completed = job.completed_runs,
            failed = job.failed_runs,
            best = ?job.best_run_key,
            "Job finished"
        );
        Ok(JobSummary::new(&job, &arena))
    }

    pub async fn job_summary(&self, job_id: JobId) -> EngineResult<JobSummary> {
        let (job, arena) = with_retry(&self.config, "load_job", || self.store.load_job(job_id)).await?;
        Ok(JobSummary::new(&job, &arena))
    }

    pub async fn list_jobs(&self, limit: usize) -> EngineResult<Vec<OptimizationJob>> {
        with_retry(&self.config, "list_jobs", || self.store.list_jobs(limit)).await
    }

    /// Parameters of the best completed run matching `query`, across all jobs
    pub async fn best_params(&self, query: &RunQuery, metric: Metric) -> EngineResult<Option<BestParams>> {
        let runs = with_retry(&self.config, "completed_runs", || self.store.completed_runs(query)).await?;
        Ok(select_best(&runs, metric, query.min_trades))
    }

    /// Statistics of two parameter sets over one scope. Stored results are
    /// reused when a completed run with the same key exists; otherwise the
    /// scope is backtested on demand.
    pub async fn compare_params(
        &self,
        a: &SimulationParameters,
        b: &SimulationParameters,
        scope: &Scope,
    ) -> EngineResult<ComparisonReport> {
        a.validate()?;
        b.validate()?;
        if scope.start >= scope.end {
            return Err(EngineError::Config(format!(
                "scope start {} must precede end {}",
                scope.start, scope.end
            )));
        }

        let mut series: Option<ScopeSeries> = None;
        let side_a = self.comparison_side(a, scope, &mut series).await?;
        let side_b = self.comparison_side(b, scope, &mut series).await?;
        Ok(ComparisonReport::new(scope.clone(), side_a, side_b))
    }

    async fn comparison_side(
        &self,
        params: &SimulationParameters,
        scope: &Scope,
        series: &mut Option<ScopeSeries>,
    ) -> EngineResult<ComparisonSide> {
        // stored runs only count when their current range is exactly `scope`;
        // an extended run keeps its creation key but covers a longer range
        if let Some(run) =
            with_retry(&self.config, "latest_completed", || self.store.latest_completed(scope, params)).await?
        {
            return Ok(ComparisonSide {
                params: params.clone(),
                run_key: run.run_key,
                origin: StatsOrigin::Stored,
                statistics: run.statistics,
            });
        }

        let (candles, intrabar) = match series {
            Some(loaded) => loaded.clone(),
            None => {
                let candles: Arc<[Candle]> = Arc::from(
                    with_retry(&self.config, "get_candles", || {
                        self.candles
                            .get_candles(&scope.symbol, scope.timeframe, scope.start, scope.end)
                    })
                    .await?,
                );
                let intrabar = load_intrabar(
                    &self.config,
                    self.candles.as_ref(),
                    &scope.symbol,
                    scope.timeframe,
                    scope.start,
                    scope.end,
                )
                .await;
                *series = Some((candles.clone(), intrabar.clone()));
                (candles, intrabar)
            }
        };

        let intrabar_replay = intrabar.is_some();
        let config = self.config.clone();
        let scope_owned = scope.clone();
        let params_owned = params.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_backtest(&scope_owned, &params_owned, candles, &config, intrabar)
        })
        .await
        .map_err(|e| EngineError::Simulation(format!("worker panicked: {e}")))??;

        Ok(ComparisonSide {
            params: params.clone(),
            run_key: compute_run_key(scope, params),
            origin: StatsOrigin::Computed { intrabar_replay },
            statistics: outcome.statistics,
        })
    }
}

/// The single writer's pending batch
struct Writer<'a> {
    config: &'a EngineConfig,
    store: &'a dyn RunStore,
    job_id: JobId,
    dirty: Vec<RunId>,
    storage_error: Option<EngineError>,
    halt: Arc<AtomicBool>,
}

impl Writer<'_> {
    async fn commit(&mut self, arena: &RunArena) {
        if self.dirty.is_empty() || self.storage_error.is_some() {
            return;
        }
        let batch: Vec<OptimizationRun> = self
            .dirty
            .iter()
            .filter_map(|id| arena.get(*id).cloned())
            .collect();

        match with_retry(self.config, "save_runs", || self.store.save_runs(self.job_id, &batch)).await {
            Ok(()) => {
                debug!(job_id = self.job_id, runs = batch.len(), "Run batch committed");
                self.dirty.clear();
            }
            Err(e) => {
                error!(job_id = self.job_id, runs = batch.len(), error = %e, "Run batch lost, halting job");
                self.halt.store(true, Ordering::Relaxed);
                self.storage_error = Some(e);
            }
        }
    }
}

/// Apply a worker result to its run; true when the run completed
fn record_result(run: &mut OptimizationRun, result: EngineResult<RunOutcome>, retention: usize) -> bool {
    // results for runs that never started (scope-level failures) still pass through running
    if run.status != RunStatus::Running {
        if let Err(e) = run.set_status(RunStatus::Running) {
            error!(run = %run.run_key, error = %e, "Bad run transition");
        }
    }

    let error = match result {
        Ok(outcome) => match run.complete(outcome, retention) {
            Ok(()) => return true,
            Err(e) => e,
        },
        Err(e) => e,
    };

    match &error {
        EngineError::Timeout(_) => warn!(run = %run.run_key, error = %error, "Run timed out"),
        _ => warn!(run = %run.run_key, kind = error.kind(), error = %error, "Run failed"),
    }
    if let Err(e) = run.fail(&error) {
        error!(run = %run.run_key, error = %e, "Bad run transition");
    }
    false
}

/// Group runs by (symbol, timeframe) so each candle series is loaded once
fn group_runs(arena: &RunArena) -> Vec<ScopeGroup> {
    let mut groups: BTreeMap<(String, Timeframe), ScopeGroup> = BTreeMap::new();
    for run in arena.iter() {
        let group = groups
            .entry((run.scope.symbol.clone(), run.scope.timeframe))
            .or_insert_with(|| ScopeGroup {
                symbol: run.scope.symbol.clone(),
                timeframe: run.scope.timeframe,
                start: run.scope.start,
                end: run.scope.end,
                tasks: Vec::new(),
            });
        group.start = group.start.min(run.scope.start);
        group.end = group.end.max(run.scope.end);
        group.tasks.push(RunTask {
            id: run.id,
            scope: run.scope.clone(),
            params: run.params.clone(),
            state: if run.needs_restart() {
                RunState::default()
            } else {
                run.state.clone()
            },
        });
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{EntryMethod, TpMethod};
    use crate::statistics::Statistics;
    use crate::store::{
        candle_to_record, zone_to_record, SqliteCandleSource, SqlitePatternStore, SqliteRunStore,
    };
    use crate::types::{Direction, ZoneContext};
    use crate::worker::tests::walk;
    use async_trait::async_trait;
    use persistence::repository::{CandleRepository, PatternRepository};
    use persistence::Database;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    const HOUR: i64 = 3_600_000;
    const SYMBOL: &str = "BTC/USDT";

    fn config() -> EngineConfig {
        EngineConfig {
            max_workers: 3,
            batch_size: 5,
            min_trades: 1,
            store_retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    async fn seeded_db(candles: usize) -> Database {
        let db = Database::in_memory().await.unwrap();
        let records: Vec<_> = walk(candles)
            .iter()
            .map(|c| candle_to_record(SYMBOL, Timeframe::H1, c))
            .collect();
        CandleRepository::new(db.pool()).insert_batch(&records).await.unwrap();
        db
    }

    fn orchestrator(db: &Database, config: EngineConfig) -> Orchestrator {
        Orchestrator::new(
            config.clone(),
            Arc::new(SqliteCandleSource::new(db.pool_clone())),
            Arc::new(SqliteRunStore::new(db.pool_clone(), config.trade_retention)),
        )
    }

    fn scope_set(symbols: &[&str], end: i64) -> ScopeSet {
        ScopeSet {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            timeframes: vec![Timeframe::H1],
            pattern_types: vec![PatternType::Fvg, PatternType::OrderBlock],
            start: 0,
            end,
            zone_source: ZoneSourceKind::Replay,
        }
    }

    fn grid() -> ParameterGrid {
        ParameterGrid {
            rr_target: vec![dec!(1.5), dec!(2)],
            sl_buffer_pct: vec![dec!(10)],
            min_zone_pct: vec![dec!(0.1)],
            entry_method: vec![EntryMethod::ZoneEdge, EntryMethod::ZoneMid],
            tp_method: vec![TpMethod::FixedRr],
            use_overlap_detection: vec![true],
        }
    }

    fn by_params(arena: &RunArena) -> Vec<(PatternType, SimulationParameters, Statistics)> {
        let mut rows: Vec<_> = arena
            .iter()
            .map(|r| (r.scope.pattern_type, r.params.clone(), r.statistics.clone()))
            .collect();
        rows.sort_by_key(|(p, params, _)| (*p, params.canonical()));
        rows
    }

    #[tokio::test]
    async fn test_run_job_completes_every_run() {
        let db = seeded_db(400).await;
        let orch = orchestrator(&db, config());
        let id = orch
            .create_job("all", scope_set(&[SYMBOL], 400 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();

        let progress = Arc::new(JobProgress::new());
        let summary = orch
            .run_job(id, RunJobOptions::default(), progress.clone())
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.total_runs, 8);
        assert_eq!(summary.completed_runs, 8);
        assert_eq!(summary.failed_runs, 0);
        assert_eq!(summary.pending_runs, 0);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.completed, 8);
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.progress_pct, 100.0);

        let (job, arena) = SqliteRunStore::new(db.pool_clone(), 100).load_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(arena.iter().all(|r| r.status == RunStatus::Completed));
        assert!(arena.iter().any(|r| r.statistics.total_trades > 0));

        let expected = select_best(arena.iter(), Metric::TotalProfitPct, 1);
        assert_eq!(job.best_params, expected.as_ref().map(|b| b.params.clone()));
        assert_eq!(summary.best_run_key, expected.map(|b| b.run_key));
    }

    #[tokio::test]
    async fn test_extended_range_matches_single_pass() {
        let db = seeded_db(400).await;
        let orch = orchestrator(&db, config());
        let progress = Arc::new(JobProgress::new());

        let split = orch
            .create_job("split", scope_set(&[SYMBOL], 180 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();
        orch.run_job(split, RunJobOptions::default(), progress.clone())
            .await
            .unwrap();
        orch.run_job(split, RunJobOptions { end: Some(400 * HOUR) }, progress.clone())
            .await
            .unwrap();

        let whole = orch
            .create_job("whole", scope_set(&[SYMBOL], 400 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();
        orch.run_job(whole, RunJobOptions::default(), progress.clone())
            .await
            .unwrap();

        let store = SqliteRunStore::new(db.pool_clone(), 100);
        let (split_job, split_runs) = store.load_job(split).await.unwrap();
        let (_, whole_runs) = store.load_job(whole).await.unwrap();

        assert_eq!(split_job.scope_set.end, 400 * HOUR);
        assert!(split_runs.iter().all(|r| r.state.invocations == 2));
        assert_eq!(by_params(&split_runs), by_params(&whole_runs));
    }

    #[tokio::test]
    async fn test_range_cannot_shrink() {
        let db = seeded_db(100).await;
        let orch = orchestrator(&db, config());
        let id = orch
            .create_job("j", scope_set(&[SYMBOL], 100 * HOUR), grid(), Metric::WinRate)
            .await
            .unwrap();
        let err = orch
            .run_job(id, RunJobOptions { end: Some(50 * HOUR) }, Arc::new(JobProgress::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_scope_without_data_fails_only_its_runs() {
        let db = seeded_db(300).await;
        let orch = orchestrator(&db, config());
        let id = orch
            .create_job(
                "mixed",
                scope_set(&[SYMBOL, "NODATA/USDT"], 300 * HOUR),
                grid(),
                Metric::TotalProfitPct,
            )
            .await
            .unwrap();

        let summary = orch
            .run_job(id, RunJobOptions::default(), Arc::new(JobProgress::new()))
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.completed_runs, 8);
        assert_eq!(summary.failed_runs, 8);
        assert!(summary
            .failures
            .iter()
            .all(|f| f.scope.symbol == "NODATA/USDT" && f.error.kind == "data"));
    }

    #[tokio::test]
    async fn test_job_fails_when_every_run_fails() {
        let db = seeded_db(10).await;
        let orch = orchestrator(&db, config());
        let id = orch
            .create_job("short", scope_set(&[SYMBOL], 10 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();
        let summary = orch
            .run_job(id, RunJobOptions::default(), Arc::new(JobProgress::new()))
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(summary.failed_runs, 8);
        assert!(summary.error.unwrap().contains("all 8 runs failed"));
        assert!(summary.best_params.is_none());
    }

    /// Requests cancellation as soon as the first candle series is read
    struct CancellingSource {
        inner: SqliteCandleSource,
        progress: Arc<JobProgress>,
    }

    #[async_trait]
    impl CandleSource for CancellingSource {
        async fn get_candles(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            start: i64,
            end: i64,
        ) -> EngineResult<Vec<Candle>> {
            self.progress.cancel();
            self.inner.get_candles(symbol, timeframe, start, end).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_scheduling() {
        let db = seeded_db(200).await;
        let progress = Arc::new(JobProgress::new());
        let orch = Orchestrator::new(
            config(),
            Arc::new(CancellingSource {
                inner: SqliteCandleSource::new(db.pool_clone()),
                progress: progress.clone(),
            }),
            Arc::new(SqliteRunStore::new(db.pool_clone(), 100)),
        );
        let id = orch
            .create_job("cancel", scope_set(&[SYMBOL], 200 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();

        let summary = orch
            .run_job(id, RunJobOptions::default(), progress.clone())
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.completed_runs, 0);
        assert_eq!(summary.pending_runs, 8);
        assert_eq!(progress.snapshot().skipped, 8);
        assert!(!progress.is_cancelled());

        // a cancelled job can be invoked again
        let orch = orchestrator(&db, config());
        let summary = orch
            .run_job(id, RunJobOptions::default(), progress)
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.completed_runs, 8);
    }

    /// Fails the first `failures` batch writes
    struct FlakyStore {
        inner: SqliteRunStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl RunStore for FlakyStore {
        async fn create_job(&self, job: &OptimizationJob, runs: &RunArena) -> EngineResult<JobId> {
            self.inner.create_job(job, runs).await
        }
        async fn load_job(&self, id: JobId) -> EngineResult<(OptimizationJob, RunArena)> {
            self.inner.load_job(id).await
        }
        async fn update_job(&self, job: &OptimizationJob) -> EngineResult<()> {
            self.inner.update_job(job).await
        }
        async fn save_runs(&self, job_id: JobId, runs: &[OptimizationRun]) -> EngineResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(EngineError::Storage("disk I/O error".into()));
            }
            self.inner.save_runs(job_id, runs).await
        }
        async fn completed_runs(&self, query: &RunQuery) -> EngineResult<Vec<OptimizationRun>> {
            self.inner.completed_runs(query).await
        }
        async fn latest_completed(
            &self,
            scope: &Scope,
            params: &SimulationParameters,
        ) -> EngineResult<Option<OptimizationRun>> {
            self.inner.latest_completed(scope, params).await
        }
        async fn list_jobs(&self, limit: usize) -> EngineResult<Vec<OptimizationJob>> {
            self.inner.list_jobs(limit).await
        }
    }

    fn flaky(db: &Database, failures: u32) -> Orchestrator {
        Orchestrator::new(
            config(),
            Arc::new(SqliteCandleSource::new(db.pool_clone())),
            Arc::new(FlakyStore {
                inner: SqliteRunStore::new(db.pool_clone(), 100),
                failures: AtomicU32::new(failures),
            }),
        )
    }

    #[tokio::test]
    async fn test_transient_storage_errors_are_retried() {
        let db = seeded_db(200).await;
        let orch = flaky(&db, 2);
        let id = orch
            .create_job("retry", scope_set(&[SYMBOL], 200 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();
        let summary = orch
            .run_job(id, RunJobOptions::default(), Arc::new(JobProgress::new()))
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Completed);

        let (_, arena) = SqliteRunStore::new(db.pool_clone(), 100).load_job(id).await.unwrap();
        assert_eq!(arena.count(RunStatus::Completed), 8);
    }

    #[tokio::test]
    async fn test_persistent_storage_errors_fail_the_job() {
        let db = seeded_db(200).await;
        let orch = flaky(&db, u32::MAX);
        let id = orch
            .create_job("broken", scope_set(&[SYMBOL], 200 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();
        let progress = Arc::new(JobProgress::new());
        let summary = orch
            .run_job(id, RunJobOptions::default(), progress.clone())
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Failed);
        assert!(summary.error.unwrap().contains("could not be saved"));
        assert_eq!(progress.snapshot().status, JobStatus::Failed);

        let (job, arena) = SqliteRunStore::new(db.pool_clone(), 100).load_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(arena.count(RunStatus::Completed), 0);
    }

    #[tokio::test]
    async fn test_create_job_rejects_bad_input() {
        let db = seeded_db(10).await;
        let orch = orchestrator(&db, config());

        let mut bad_grid = grid();
        bad_grid.rr_target = vec![dec!(0)];
        let err = orch
            .create_job("bad", scope_set(&[SYMBOL], HOUR), bad_grid, Metric::WinRate)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let small = orchestrator(&db, EngineConfig { max_runs_per_job: 3, ..config() });
        let err = small
            .create_job("big", scope_set(&[SYMBOL], HOUR), grid(), Metric::WinRate)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let mut production = scope_set(&[SYMBOL], HOUR);
        production.zone_source = ZoneSourceKind::Production;
        let err = orch
            .create_job("prod", production, grid(), Metric::WinRate)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        assert!(orch.list_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let db = seeded_db(10).await;
        let orch = orchestrator(&db, config());
        let err = orch
            .run_job(42, RunJobOptions::default(), Arc::new(JobProgress::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(matches!(orch.job_summary(42).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_production_zones_are_used() {
        let db = seeded_db(100).await;
        let zone = PatternZone {
            pattern_type: PatternType::Fvg,
            direction: Direction::Bullish,
            zone_high: dec!(101),
            zone_low: dec!(99),
            detected_at: 10 * HOUR,
            context: ZoneContext::default(),
        };
        PatternRepository::new(db.pool())
            .save(&zone_to_record(SYMBOL, Timeframe::H1, &zone))
            .await
            .unwrap();

        let orch = orchestrator(&db, config())
            .with_pattern_store(Arc::new(SqlitePatternStore::new(db.pool_clone())));
        let mut scopes = scope_set(&[SYMBOL], 100 * HOUR);
        scopes.pattern_types = vec![PatternType::Fvg];
        scopes.zone_source = ZoneSourceKind::Production;
        let id = orch.create_job("prod", scopes, grid(), Metric::WinRate).await.unwrap();

        let summary = orch
            .run_job(id, RunJobOptions::default(), Arc::new(JobProgress::new()))
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.completed_runs, 4);

        let (_, arena) = SqliteRunStore::new(db.pool_clone(), 100).load_job(id).await.unwrap();
        // a single zone yields at most one trade per run
        assert!(arena
            .iter()
            .all(|r| r.statistics.total_trades + r.state.open_trades.len() as u32 + r.state.pending.len() as u32 <= 1));
    }

    #[tokio::test]
    async fn test_best_params_and_compare() {
        let db = seeded_db(400).await;
        let orch = orchestrator(&db, config());
        let id = orch
            .create_job("best", scope_set(&[SYMBOL], 400 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();
        let summary = orch
            .run_job(id, RunJobOptions::default(), Arc::new(JobProgress::new()))
            .await
            .unwrap();

        let query = RunQuery {
            job_id: Some(id),
            min_trades: 1,
            ..Default::default()
        };
        let best = orch.best_params(&query, Metric::TotalProfitPct).await.unwrap();
        assert_eq!(best.map(|b| b.run_key), summary.best_run_key);

        let none = RunQuery {
            symbol: Some("ETH/USDT".into()),
            ..Default::default()
        };
        assert!(orch.best_params(&none, Metric::WinRate).await.unwrap().is_none());

        let scope = Scope {
            symbol: SYMBOL.into(),
            timeframe: Timeframe::H1,
            pattern_type: PatternType::Fvg,
            start: 0,
            end: 400 * HOUR,
        };
        let stored = grid().expand()[0].clone();
        let fresh = SimulationParameters {
            rr_target: dec!(3),
            ..stored.clone()
        };
        let report = orch.compare_params(&stored, &fresh, &scope).await.unwrap();
        assert_eq!(report.a.origin, StatsOrigin::Stored);
        // no 5m candles seeded, so the on-demand side ran without intrabar replay
        assert_eq!(
            report.b.origin,
            StatsOrigin::Computed {
                intrabar_replay: false
            }
        );
        let profit = report
            .metrics
            .iter()
            .find(|m| m.metric == "total_profit_pct")
            .unwrap();
        assert_eq!(profit.delta, profit.b - profit.a);

        let invalid = SimulationParameters {
            rr_target: dec!(-1),
            ..stored.clone()
        };
        assert!(matches!(
            orch.compare_params(&stored, &invalid, &scope).await,
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_compare_after_extension_uses_matching_range() {
        let db = seeded_db(400).await;
        let orch = orchestrator(&db, config());
        let progress = Arc::new(JobProgress::new());
        let id = orch
            .create_job("ext", scope_set(&[SYMBOL], 180 * HOUR), grid(), Metric::TotalProfitPct)
            .await
            .unwrap();
        orch.run_job(id, RunJobOptions::default(), progress.clone())
            .await
            .unwrap();
        orch.run_job(id, RunJobOptions { end: Some(400 * HOUR) }, progress)
            .await
            .unwrap();

        let params = grid().expand()[0].clone();
        let short = Scope {
            symbol: SYMBOL.into(),
            timeframe: Timeframe::H1,
            pattern_type: PatternType::Fvg,
            start: 0,
            end: 180 * HOUR,
        };
        let long = Scope {
            end: 400 * HOUR,
            ..short.clone()
        };

        let (_, arena) = SqliteRunStore::new(db.pool_clone(), 100).load_job(id).await.unwrap();
        let extended = arena
            .iter()
            .find(|r| r.scope == long && r.params == params)
            .unwrap();
        assert_eq!(extended.run_key, compute_run_key(&short, &params));

        // the extended run covers 0..400h, so the original range is recomputed
        let report = orch.compare_params(&params, &params, &short).await.unwrap();
        assert!(matches!(report.a.origin, StatsOrigin::Computed { .. }));
        let expected = run_backtest(&short, &params, Arc::from(walk(400)), &config(), None).unwrap();
        assert_eq!(report.a.statistics, expected.statistics);
        assert!(extended.statistics.total_trades >= expected.statistics.total_trades);

        let report = orch.compare_params(&params, &params, &long).await.unwrap();
        assert_eq!(report.a.origin, StatsOrigin::Stored);
        assert_eq!(report.a.run_key, extended.run_key);
        assert_eq!(report.a.statistics, extended.statistics);
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_timeout() {
        let scope = Scope {
            symbol: SYMBOL.into(),
            timeframe: Timeframe::H1,
            pattern_type: PatternType::Fvg,
            start: 0,
            end: i64::MAX,
        };
        let config = config();
        let input = RunInput {
            simulator: build_simulator(&scope, &config, None),
            scope,
            params: grid().expand()[0].clone(),
            candles: Arc::from(walk(300)),
            zones: ZoneSource::Detect(config.detector.clone()),
            state: RunState::default(),
            deadline: None,
            budget_secs: 0,
        };
        let permit = Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap();
        let result = execute_with_budget(input, permit, Some(Duration::ZERO)).await;
        assert_eq!(result, Err(EngineError::Timeout(0)));
    }

    #[test]
    fn test_progress_counters() {
        let progress = JobProgress::new();
        assert!(!progress.is_running());
        progress.reset(7, 4);
        assert!(progress.is_running());
        progress.completed.store(1, Ordering::Relaxed);
        progress.failed.store(1, Ordering::Relaxed);
        assert_eq!(progress.progress_pct(), 50.0);

        progress.cancel();
        assert!(progress.snapshot().cancelled);
        progress.finish(JobStatus::Cancelled, None);
        assert!(!progress.is_running());
        assert_eq!(progress.snapshot().job_id, Some(7));
    }

    #[test]
    fn test_try_start_claims_once() {
        let progress = Arc::new(JobProgress::new());
        let claims: Vec<bool> = (0..8)
            .map(|i| {
                let progress = progress.clone();
                std::thread::spawn(move || progress.try_start(i))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(claims.iter().filter(|c| **c).count(), 1);
        assert!(progress.is_running());

        progress.finish(JobStatus::Failed, Some("bad end".into()));
        assert!(progress.try_start(9));
        assert_eq!(progress.snapshot().job_id, Some(9));
        assert_eq!(progress.snapshot().error_message, None);
    }

    #[tokio::test]
    async fn test_claimed_tracker_runs_the_job() {
        let db = seeded_db(200).await;
        let orch = orchestrator(&db, config());
        let id = orch
            .create_job("claimed", scope_set(&[SYMBOL], 200 * HOUR), grid(), Metric::WinRate)
            .await
            .unwrap();

        let progress = Arc::new(JobProgress::new());
        assert!(progress.try_start(id));
        assert!(!progress.try_start(id));
        let summary = orch
            .run_job(id, RunJobOptions::default(), progress.clone())
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert!(!progress.is_running());
        assert!(progress.try_start(id));
    }
}
