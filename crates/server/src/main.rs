//! Zone Optimizer: backtest and tune pattern-zone strategies
//!
//! Usage:
//!   zone-optimizer serve --port 3001  # Launch the admin API
//!   zone-optimizer import-candles data.json --symbol BTC/USDT --timeframe 1h
//!   zone-optimizer create-job --symbols BTC/USDT --timeframes 1h --start 2024-01-01 --end 2024-06-01
//!   zone-optimizer run-job 1 --end 2024-07-01  # Run (or extend) a job from CLI

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use engine::store::{candle_to_record, zone_to_record};
use engine::{
    Candle, EngineConfig, EngineError, EntryMethod, JobProgress, JobStatus, Metric, Orchestrator,
    ParameterGrid, PatternType, PatternZone, RunJobOptions, RunQuery, Scope, ScopeSet,
    SimulationParameters, SqliteCandleSource, SqlitePatternStore, SqliteRunStore, Timeframe,
    TpMethod, ZoneSourceKind,
};
use persistence::repository::{CandleRepository, PatternRepository};
use persistence::Database;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "zone-optimizer")]
#[command(about = "Backtest and optimize pattern-zone trading parameters", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the admin API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Import candles from a JSON array of {timestamp, open, high, low, close, volume}
    ImportCandles {
        file: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        timeframe: Timeframe,
    },
    /// Import production zones from a JSON array of pattern zones
    ImportPatterns {
        file: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        timeframe: Timeframe,
    },
    /// Create an optimization job over a scope set and parameter grid
    CreateJob {
        #[arg(long, default_value = "optimization")]
        name: String,
        /// Symbols (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        /// Timeframes (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        timeframes: Vec<Timeframe>,
        /// Pattern types (comma-separated, all when omitted)
        #[arg(long, value_delimiter = ',')]
        patterns: Vec<PatternType>,
        /// Range start: epoch ms, YYYY-MM-DD or RFC 3339
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Built-in grid name (default, quick) or path to a grid JSON file
        #[arg(long, default_value = "default")]
        grid: String,
        #[arg(long, default_value = "total_profit_pct")]
        metric: Metric,
        /// Use zones from the production pattern store instead of replaying detection
        #[arg(long)]
        production: bool,
    },
    /// Run a job (again), optionally extending its end date
    RunJob {
        id: i64,
        #[arg(long)]
        end: Option<String>,
    },
    /// List recent jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job summary
    Summary { id: i64 },
    /// Best parameters over completed runs
    Best {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        timeframe: Option<Timeframe>,
        #[arg(long)]
        pattern: Option<PatternType>,
        #[arg(long)]
        job: Option<i64>,
        #[arg(long, default_value = "total_profit_pct")]
        metric: Metric,
        #[arg(long)]
        min_trades: Option<u32>,
    },
    /// Compare two parameter sets (JSON objects) over one scope
    Compare {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        a: String,
        #[arg(long)]
        b: String,
    },
    /// Single sequential backtest of one parameter set
    Backtest {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value = "2")]
        rr: Decimal,
        #[arg(long, default_value = "10")]
        sl_buffer: Decimal,
        #[arg(long, default_value = "0.15")]
        min_zone: Decimal,
        #[arg(long, default_value = "zone_edge")]
        entry: EntryMethod,
        #[arg(long, default_value = "fixed_rr")]
        tp: TpMethod,
        #[arg(long)]
        no_overlap_filter: bool,
    },
}

#[derive(clap::Args)]
struct ScopeArgs {
    #[arg(long)]
    symbol: String,
    #[arg(long)]
    timeframe: Timeframe,
    #[arg(long)]
    pattern: PatternType,
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
}

impl ScopeArgs {
    fn to_scope(&self) -> anyhow::Result<Scope> {
        Ok(Scope {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            pattern_type: self.pattern,
            start: parse_time(&self.start)?,
            end: parse_time(&self.end)?,
        })
    }
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    progress: Arc<JobProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,zone_optimizer=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,zone_optimizer=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

/// Epoch milliseconds, a calendar date (midnight UTC) or an RFC 3339 timestamp
fn parse_time(s: &str) -> anyhow::Result<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow::anyhow!("invalid date '{}'", s))?;
        return Ok(midnight.and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| anyhow::anyhow!("unrecognised time '{}' (epoch ms, YYYY-MM-DD or RFC 3339)", s))
}

fn db_path() -> String {
    std::env::var("ZONE_OPT_DB_PATH").unwrap_or_else(|_| "data/optimizer.db".to_string())
}

async fn open_db() -> anyhow::Result<Database> {
    let path = db_path();
    Database::new(&path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })
}

fn build_orchestrator(db: &Database, config: EngineConfig) -> Orchestrator {
    let retention = config.trade_retention;
    Orchestrator::new(
        config,
        Arc::new(SqliteCandleSource::new(db.pool_clone())),
        Arc::new(SqliteRunStore::new(db.pool_clone(), retention)),
    )
    .with_pattern_store(Arc::new(SqlitePatternStore::new(db.pool_clone())))
}

/// Built-in grid name or a JSON file; missing keys take the default grid's values
fn load_grid(name_or_path: &str) -> anyhow::Result<ParameterGrid> {
    if let Ok(grid) = ParameterGrid::named(name_or_path) {
        return Ok(grid);
    }
    let raw = std::fs::read_to_string(name_or_path)
        .map_err(|e| anyhow::anyhow!("grid '{}' is neither built-in nor a readable file: {}", name_or_path, e))?;
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::ImportCandles {
            file,
            symbol,
            timeframe,
        } => {
            cmd_import_candles(file, &symbol, timeframe).await?;
        }
        Commands::ImportPatterns {
            file,
            symbol,
            timeframe,
        } => {
            cmd_import_patterns(file, &symbol, timeframe).await?;
        }
        Commands::CreateJob {
            name,
            symbols,
            timeframes,
            patterns,
            start,
            end,
            grid,
            metric,
            production,
        } => {
            let scope_set = ScopeSet {
                symbols,
                timeframes,
                pattern_types: if patterns.is_empty() {
                    PatternType::ALL.to_vec()
                } else {
                    patterns
                },
                start: parse_time(&start)?,
                end: parse_time(&end)?,
                zone_source: if production {
                    ZoneSourceKind::Production
                } else {
                    ZoneSourceKind::Replay
                },
            };
            cmd_create_job(&name, scope_set, load_grid(&grid)?, metric).await?;
        }
        Commands::RunJob { id, end } => {
            let end = end.as_deref().map(parse_time).transpose()?;
            cmd_run_job(id, end).await?;
        }
        Commands::Jobs { limit } => {
            cmd_jobs(limit).await?;
        }
        Commands::Summary { id } => {
            cmd_summary(id).await?;
        }
        Commands::Best {
            symbol,
            timeframe,
            pattern,
            job,
            metric,
            min_trades,
        } => {
            let config = EngineConfig::from_env();
            let query = RunQuery {
                job_id: job,
                symbol,
                timeframe,
                pattern_type: pattern,
                min_trades: min_trades.unwrap_or(config.min_trades),
            };
            cmd_best(config, query, metric).await?;
        }
        Commands::Compare { scope, a, b } => {
            let a: SimulationParameters = serde_json::from_str(&a)?;
            let b: SimulationParameters = serde_json::from_str(&b)?;
            cmd_compare(scope.to_scope()?, a, b).await?;
        }
        Commands::Backtest {
            scope,
            rr,
            sl_buffer,
            min_zone,
            entry,
            tp,
            no_overlap_filter,
        } => {
            let params = SimulationParameters {
                rr_target: rr,
                sl_buffer_pct: sl_buffer,
                min_zone_pct: min_zone,
                entry_method: entry,
                tp_method: tp,
                use_overlap_detection: !no_overlap_filter,
            };
            cmd_backtest(scope.to_scope()?, params).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Serve command: Axum admin API
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Zone Optimizer v{} starting...", APP_VERSION);

    let db = open_db().await?;
    let config = EngineConfig::from_env();
    info!(
        db = %db_path(),
        workers = config.max_workers,
        timeout_secs = config.run_timeout_secs,
        "Database initialized"
    );

    let state = AppState {
        orchestrator: Arc::new(build_orchestrator(&db, config)),
        progress: Arc::new(JobProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/jobs", post(api_create_job).get(api_list_jobs))
        .route("/jobs/status", get(api_job_status))
        .route("/jobs/cancel", post(api_cancel_job))
        .route("/jobs/:id/run", post(api_run_job))
        .route("/jobs/:id/summary", get(api_job_summary))
        .route("/best-params", get(api_best_params))
        .route("/compare", post(api_compare))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Zone Optimizer v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/jobs                - Create an optimization job");
    println!("  GET  /api/jobs                - List recent jobs");
    println!("  POST /api/jobs/:id/run        - Run (or extend) a job in the background");
    println!("  GET  /api/jobs/:id/summary    - Job summary");
    println!("  GET  /api/jobs/status         - Poll the running job");
    println!("  POST /api/jobs/cancel         - Cancel the running job");
    println!("  GET  /api/best-params         - Best parameters over completed runs");
    println!("  POST /api/compare             - Compare two parameter sets");
    println!("\n  Database: {}", db_path());
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// CLI commands
// ============================================================================

async fn cmd_import_candles(file: PathBuf, symbol: &str, timeframe: Timeframe) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&file)?;
    let candles: Vec<Candle> = serde_json::from_str(&raw)?;
    let records: Vec<_> = candles
        .iter()
        .map(|c| candle_to_record(symbol, timeframe, c))
        .collect();

    let db = open_db().await?;
    let inserted = CandleRepository::new(db.pool()).insert_batch(&records).await?;
    println!(
        "Imported {} new candles for {} {} ({} in file)",
        inserted,
        symbol,
        timeframe,
        records.len()
    );

    for series in CandleRepository::new(db.pool()).series().await? {
        println!(
            "  {:<12} {:<4} {:>8} candles  [{} .. {}]",
            series.symbol, series.timeframe, series.count, series.first_ts, series.last_ts
        );
    }
    Ok(())
}

async fn cmd_import_patterns(file: PathBuf, symbol: &str, timeframe: Timeframe) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&file)?;
    let zones: Vec<PatternZone> = serde_json::from_str(&raw)?;

    let db = open_db().await?;
    let repo = PatternRepository::new(db.pool());
    let mut inserted = 0usize;
    for zone in &zones {
        if repo.save(&zone_to_record(symbol, timeframe, zone)).await? {
            inserted += 1;
        }
    }
    println!(
        "Imported {} new production zones for {} {} ({} in file)",
        inserted,
        symbol,
        timeframe,
        zones.len()
    );
    Ok(())
}

async fn cmd_create_job(
    name: &str,
    scope_set: ScopeSet,
    grid: ParameterGrid,
    metric: Metric,
) -> anyhow::Result<()> {
    let db = open_db().await?;
    let orchestrator = build_orchestrator(&db, EngineConfig::from_env());
    let combinations = grid.combinations();
    let id = orchestrator.create_job(name, scope_set, grid, metric).await?;
    println!("Created job {} ({} parameter combinations per scope)", id, combinations);
    Ok(())
}

async fn cmd_run_job(id: i64, end: Option<i64>) -> anyhow::Result<()> {
    println!("\n=== Zone Optimizer v{} ===", APP_VERSION);
    let db = open_db().await?;
    let orchestrator = Arc::new(build_orchestrator(&db, EngineConfig::from_env()));
    let progress = Arc::new(JobProgress::new());

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let runner = orchestrator.clone();
    let progress_clone = progress.clone();
    let handle = tokio::spawn(async move {
        runner
            .run_job(id, RunJobOptions { end }, progress_clone)
            .await
    });

    // Progress display loop
    while !handle.is_finished() {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        if !progress.is_running() {
            continue;
        }
        let pct = progress.progress_pct();
        let bar_len = 30;
        let filled = (pct as usize * bar_len) / 100;
        let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
        print!(
            "\r  [{}] {:.0}% ({} done, {} failed, {} running of {})   ",
            bar,
            pct,
            progress.completed.load(Ordering::Relaxed),
            progress.failed.load(Ordering::Relaxed),
            progress.running.load(Ordering::Relaxed),
            progress.total.load(Ordering::Relaxed),
        );
        std::io::stdout().flush().ok();
    }
    println!();

    let summary = handle.await??;
    print_summary(&summary);
    Ok(())
}

async fn cmd_jobs(limit: usize) -> anyhow::Result<()> {
    let db = open_db().await?;
    let orchestrator = build_orchestrator(&db, EngineConfig::from_env());
    let jobs = orchestrator.list_jobs(limit).await?;
    if jobs.is_empty() {
        println!("No jobs yet");
        return Ok(());
    }
    println!(
        "  {:>4}  {:<24} {:<10} {:>6} {:>6} {:>6}  {}",
        "ID", "Name", "Status", "Runs", "Done", "Failed", "Created"
    );
    println!("  {}", "-".repeat(80));
    for job in jobs {
        println!(
            "  {:>4}  {:<24} {:<10} {:>6} {:>6} {:>6}  {}",
            job.id,
            job.name,
            job.status,
            job.total_runs,
            job.completed_runs,
            job.failed_runs,
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_summary(id: i64) -> anyhow::Result<()> {
    let db = open_db().await?;
    let orchestrator = build_orchestrator(&db, EngineConfig::from_env());
    print_summary(&orchestrator.job_summary(id).await?);
    Ok(())
}

async fn cmd_best(config: EngineConfig, query: RunQuery, metric: Metric) -> anyhow::Result<()> {
    let db = open_db().await?;
    let orchestrator = build_orchestrator(&db, config);
    match orchestrator.best_params(&query, metric).await? {
        Some(best) => {
            println!("Best by {}: {}", metric, best.value);
            println!("  params:  {}", best.params);
            println!("  run key: {}", best.run_key);
            println!("{}", serde_json::to_string_pretty(&best.statistics)?);
        }
        None => println!(
            "No completed runs with at least {} trades match",
            query.min_trades
        ),
    }
    Ok(())
}

async fn cmd_compare(scope: Scope, a: SimulationParameters, b: SimulationParameters) -> anyhow::Result<()> {
    let db = open_db().await?;
    let orchestrator = build_orchestrator(&db, EngineConfig::from_env());
    let report = orchestrator.compare_params(&a, &b, &scope).await?;

    println!("A: {} ({:?})", report.a.params, report.a.origin);
    println!("B: {} ({:?})", report.b.params, report.b.origin);
    println!(
        "\n  {:<18} {:>12} {:>12} {:>12}  {}",
        "Metric", "A", "B", "B - A", "Preferred"
    );
    println!("  {}", "-".repeat(68));
    for m in &report.metrics {
        println!(
            "  {:<18} {:>12} {:>12} {:>+12}  {:?}",
            m.metric, m.a, m.b, m.delta, m.preferred
        );
    }
    Ok(())
}

async fn cmd_backtest(scope: Scope, params: SimulationParameters) -> anyhow::Result<()> {
    let db = open_db().await?;
    let config = EngineConfig::from_env();
    let source = SqliteCandleSource::new(db.pool_clone());
    let candles = engine::CandleSource::get_candles(
        &source,
        &scope.symbol,
        scope.timeframe,
        scope.start,
        scope.end,
    )
    .await?;
    println!(
        "Backtesting {} {} {} over {} candles: {}",
        scope.symbol,
        scope.timeframe,
        scope.pattern_type,
        candles.len(),
        params
    );

    let outcome = tokio::task::spawn_blocking(move || {
        engine::run_backtest(&scope, &params, Arc::from(candles), &config, None)
    })
    .await??;

    println!(
        "Closed {} trades ({} still open, {} pending entries, {} zones)",
        outcome.closed.len(),
        outcome.state.open_trades.len(),
        outcome.state.pending.len(),
        outcome.zones_evaluated
    );
    println!("{}", serde_json::to_string_pretty(&outcome.statistics)?);
    Ok(())
}

fn print_summary(summary: &engine::JobSummary) {
    println!(
        "\nJob {} '{}': {} ({} completed, {} failed, {} pending of {})",
        summary.job_id,
        summary.name,
        summary.status,
        summary.completed_runs,
        summary.failed_runs,
        summary.pending_runs,
        summary.total_runs
    );
    if let Some(err) = &summary.error {
        println!("  Error: {}", err);
    }
    match &summary.best_params {
        Some(params) => println!("  Best by {}: {}", summary.metric, params),
        None => println!("  No run qualified for best parameters yet"),
    }

    if !summary.top_by_profit.is_empty() {
        println!("\nTop runs by total profit:");
        println!(
            "  {:>3}  {:<12} {:<4} {:<16} {:>6} {:>7} {:>9} {:>7}  {}",
            "#", "Symbol", "TF", "Pattern", "Trades", "WR", "Profit%", "Sharpe", "Params"
        );
        println!("  {}", "-".repeat(100));
        for r in &summary.top_by_profit {
            println!(
                "  {:>3}  {:<12} {:<4} {:<16} {:>6} {:>7} {:>9} {:>7}  {}",
                r.rank,
                r.scope.symbol,
                r.scope.timeframe,
                r.scope.pattern_type,
                r.statistics.total_trades,
                r.statistics.win_rate,
                r.statistics.total_profit_pct.round_dp(2),
                r.statistics.sharpe_ratio,
                r.params
            );
        }
    }

    for f in &summary.failures {
        println!(
            "  failed {} {} {}: [{}] {}",
            f.scope.symbol, f.scope.timeframe, f.scope.pattern_type, f.error.kind, f.error.message
        );
    }
}

// ============================================================================
// API Handlers
// ============================================================================

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn api_error(e: EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        EngineError::Config(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "kind": e.kind(),
            "message": e.to_string(),
        })),
    )
}

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "zone-optimizer",
        "version": APP_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    #[serde(default = "default_job_name")]
    name: String,
    scope_set: ScopeSet,
    /// Explicit grid; takes precedence over `grid_name`
    grid: Option<ParameterGrid>,
    grid_name: Option<String>,
    #[serde(default)]
    metric: Metric,
}

fn default_job_name() -> String {
    "optimization".to_string()
}

/// POST /api/jobs: create a job with all runs pending
async fn api_create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult {
    let grid = match (request.grid, request.grid_name) {
        (Some(grid), _) => grid,
        (None, Some(name)) => ParameterGrid::named(&name).map_err(api_error)?,
        (None, None) => ParameterGrid::default(),
    };
    let combinations = grid.combinations();
    let id = state
        .orchestrator
        .create_job(&request.name, request.scope_set, grid, request.metric)
        .await
        .map_err(api_error)?;

    Ok(Json(serde_json::json!({
        "success": true,
        "job_id": id,
        "combinations": combinations,
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

/// GET /api/jobs: most recent jobs first
async fn api_list_jobs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult {
    let jobs = state
        .orchestrator
        .list_jobs(query.limit.min(200))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "jobs": jobs })))
}

/// POST /api/jobs/:id/run: run or extend a job in the background
async fn api_run_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    options: Option<Json<RunJobOptions>>,
) -> ApiResult {
    // fail fast on unknown ids before going to the background
    state.orchestrator.job_summary(id).await.map_err(api_error)?;

    if !state.progress.try_start(id) {
        let pct = state.progress.progress_pct();
        return Ok(Json(serde_json::json!({
            "success": false,
            "message": format!("A job is already running ({:.0}% complete)", pct),
        })));
    }

    let options = options.map(|Json(o)| o).unwrap_or_default();
    info!(job_id = id, end = ?options.end, "Starting job via API");

    let orchestrator = state.orchestrator.clone();
    let progress = state.progress.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run_job(id, options, progress.clone()).await {
            error!(job_id = id, error = %e, "Job run failed");
            progress.finish(JobStatus::Failed, Some(e.to_string()));
        }
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Job {} started", id),
    })))
}

/// GET /api/jobs/:id/summary
async fn api_job_summary(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let summary = state.orchestrator.job_summary(id).await.map_err(api_error)?;
    Ok(Json(serde_json::json!(summary)))
}

/// GET /api/jobs/status: poll the running job
async fn api_job_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.progress.snapshot()))
}

/// POST /api/jobs/cancel: stop scheduling further runs
async fn api_cancel_job(State(state): State<AppState>) -> Json<serde_json::Value> {
    if !state.progress.is_running() {
        return Json(serde_json::json!({
            "success": false,
            "message": "No job is running"
        }));
    }
    state.progress.cancel();
    info!("Job cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested"
    }))
}

#[derive(Debug, Deserialize)]
struct BestParamsQuery {
    symbol: Option<String>,
    timeframe: Option<Timeframe>,
    pattern_type: Option<PatternType>,
    job_id: Option<i64>,
    #[serde(default)]
    metric: Metric,
    min_trades: Option<u32>,
}

/// GET /api/best-params
async fn api_best_params(
    State(state): State<AppState>,
    Query(params): Query<BestParamsQuery>,
) -> ApiResult {
    let query = RunQuery {
        job_id: params.job_id,
        symbol: params.symbol,
        timeframe: params.timeframe,
        pattern_type: params.pattern_type,
        min_trades: params
            .min_trades
            .unwrap_or(state.orchestrator.config().min_trades),
    };
    let best = state
        .orchestrator
        .best_params(&query, params.metric)
        .await
        .map_err(api_error)?;

    if best.is_none() {
        warn!(metric = %params.metric, min_trades = query.min_trades, "No run qualifies for best params");
    }
    Ok(Json(serde_json::json!({
        "success": best.is_some(),
        "best": best,
    })))
}

#[derive(Debug, Deserialize)]
struct CompareRequest {
    scope: Scope,
    a: SimulationParameters,
    b: SimulationParameters,
}

/// POST /api/compare
async fn api_compare(State(state): State<AppState>, Json(request): Json<CompareRequest>) -> ApiResult {
    let report = state
        .orchestrator
        .compare_params(&request.a, &request.b, &request.scope)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!(report)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("1704067200000").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_time("2024-01-01").unwrap(), 1_704_067_200_000);
        assert_eq!(
            parse_time("2024-01-01T01:00:00+01:00").unwrap(),
            1_704_067_200_000
        );
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_load_grid_by_name() {
        assert_eq!(load_grid("quick").unwrap(), ParameterGrid::quick());
        assert!(load_grid("/nonexistent/grid.json").is_err());
    }
}
