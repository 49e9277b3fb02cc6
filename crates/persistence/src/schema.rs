//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices and statistics stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Candle history, the default candle source
CREATE TABLE IF NOT EXISTS candles (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL DEFAULT '0',
    PRIMARY KEY (symbol, timeframe, timestamp)
);

-- Zones persisted by live detection
CREATE TABLE IF NOT EXISTS production_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    direction TEXT NOT NULL,
    zone_high TEXT NOT NULL,
    zone_low TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    context_json TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (symbol, timeframe, pattern_type, direction, detected_at, zone_low, zone_high)
);

CREATE TABLE IF NOT EXISTS optimization_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    scope_json TEXT NOT NULL,
    grid_json TEXT NOT NULL,
    metric TEXT NOT NULL,
    total_runs INTEGER NOT NULL DEFAULT 0,
    completed_runs INTEGER NOT NULL DEFAULT 0,
    failed_runs INTEGER NOT NULL DEFAULT 0,
    best_params_json TEXT,
    best_run_key TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);

-- One row per (job, scope, parameter combination)
CREATE TABLE IF NOT EXISTS optimization_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES optimization_jobs(id) ON DELETE CASCADE,
    run_key TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    params_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    total_trades INTEGER NOT NULL DEFAULT 0,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    expired INTEGER NOT NULL DEFAULT 0,
    win_rate TEXT NOT NULL DEFAULT '0',
    avg_rr TEXT NOT NULL DEFAULT '0',
    total_profit_pct TEXT NOT NULL DEFAULT '0',
    max_drawdown TEXT NOT NULL DEFAULT '0',
    sharpe_ratio TEXT NOT NULL DEFAULT '0',
    profit_factor TEXT NOT NULL DEFAULT '0',
    avg_duration TEXT NOT NULL DEFAULT '0',
    stats_state_json TEXT NOT NULL DEFAULT '{}',
    trades_json TEXT NOT NULL DEFAULT '[]',
    open_trades_json TEXT NOT NULL DEFAULT '[]',
    pending_entries_json TEXT NOT NULL DEFAULT '[]',
    last_candle_ts INTEGER,
    invocations INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (job_id, run_key)
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_patterns_scope ON production_patterns(symbol, timeframe, pattern_type, detected_at);
CREATE INDEX IF NOT EXISTS idx_runs_job_status ON optimization_runs(job_id, status);
CREATE INDEX IF NOT EXISTS idx_runs_scope ON optimization_runs(symbol, timeframe, pattern_type, status);
CREATE INDEX IF NOT EXISTS idx_runs_key ON optimization_runs(run_key)
"#;

/// Column additions applied after CREATE_TABLES; re-running them is harmless
pub const MIGRATIONS: &[&str] = &["ALTER TABLE optimization_runs ADD COLUMN error_kind TEXT"];
