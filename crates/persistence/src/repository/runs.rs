//! Optimization run repository
//!
//! Runs are inserted `pending` together with their job and afterwards only
//! rewritten in batches by `save_batch`, one transaction per batch.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

/// A persisted run: scope, parameters, flattened statistics and carried state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: Option<i64>,
    pub job_id: i64,
    pub run_key: String,
    pub symbol: String,
    pub timeframe: String,
    pub pattern_type: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub params_json: String,
    pub status: String,
    pub total_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub expired: i64,
    pub win_rate: String,
    pub avg_rr: String,
    pub total_profit_pct: String,
    pub max_drawdown: String,
    pub sharpe_ratio: String,
    pub profit_factor: String,
    pub avg_duration: String,
    pub stats_state_json: String,
    /// Most recent closed trades only; older ones are dropped on save
    pub trades_json: String,
    pub open_trades_json: String,
    pub pending_entries_json: String,
    pub last_candle_ts: Option<i64>,
    pub invocations: i64,
    // added via migration
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: String,
}

/// Filter for completed-run queries
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_id: Option<i64>,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub pattern_type: Option<String>,
    pub min_trades: i64,
}

const UPSERT_RUN: &str = r#"
INSERT INTO optimization_runs (
    job_id, run_key, symbol, timeframe, pattern_type, start_ts, end_ts, params_json, status,
    total_trades, wins, losses, expired, win_rate, avg_rr, total_profit_pct, max_drawdown,
    sharpe_ratio, profit_factor, avg_duration,
    stats_state_json, trades_json, open_trades_json, pending_entries_json,
    last_candle_ts, invocations, error_kind, error_message, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(job_id, run_key) DO UPDATE SET
    end_ts = excluded.end_ts,
    status = excluded.status,
    total_trades = excluded.total_trades,
    wins = excluded.wins,
    losses = excluded.losses,
    expired = excluded.expired,
    win_rate = excluded.win_rate,
    avg_rr = excluded.avg_rr,
    total_profit_pct = excluded.total_profit_pct,
    max_drawdown = excluded.max_drawdown,
    sharpe_ratio = excluded.sharpe_ratio,
    profit_factor = excluded.profit_factor,
    avg_duration = excluded.avg_duration,
    stats_state_json = excluded.stats_state_json,
    trades_json = excluded.trades_json,
    open_trades_json = excluded.open_trades_json,
    pending_entries_json = excluded.pending_entries_json,
    last_candle_ts = excluded.last_candle_ts,
    invocations = excluded.invocations,
    error_kind = excluded.error_kind,
    error_message = excluded.error_message,
    updated_at = excluded.updated_at
"#;

pub(crate) async fn insert_run(tx: &mut Transaction<'_, Sqlite>, run: &RunRecord) -> DbResult<()> {
    sqlx::query(UPSERT_RUN)
        .bind(run.job_id)
        .bind(&run.run_key)
        .bind(&run.symbol)
        .bind(&run.timeframe)
        .bind(&run.pattern_type)
        .bind(run.start_ts)
        .bind(run.end_ts)
        .bind(&run.params_json)
        .bind(&run.status)
        .bind(run.total_trades)
        .bind(run.wins)
        .bind(run.losses)
        .bind(run.expired)
        .bind(&run.win_rate)
        .bind(&run.avg_rr)
        .bind(&run.total_profit_pct)
        .bind(&run.max_drawdown)
        .bind(&run.sharpe_ratio)
        .bind(&run.profit_factor)
        .bind(&run.avg_duration)
        .bind(&run.stats_state_json)
        .bind(&run.trades_json)
        .bind(&run.open_trades_json)
        .bind(&run.pending_entries_json)
        .bind(run.last_candle_ts)
        .bind(run.invocations)
        .bind(&run.error_kind)
        .bind(&run.error_message)
        .bind(&run.updated_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub struct RunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Write a batch of run results in a single transaction
    pub async fn save_batch(&self, runs: &[RunRecord]) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        for run in runs {
            insert_run(&mut tx, run).await?;
        }
        tx.commit().await?;
        Ok(runs.len())
    }

    /// Every run of a job in creation order
    pub async fn list_for_job(&self, job_id: i64) -> DbResult<Vec<RunRecord>> {
        let records = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM optimization_runs WHERE job_id = ?1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Completed runs matching the filter, with at least `min_trades` trades
    pub async fn completed(&self, filter: &RunFilter) -> DbResult<Vec<RunRecord>> {
        let mut sql = String::from(
            "SELECT * FROM optimization_runs WHERE status = 'completed' AND total_trades >= ?",
        );
        let mut binds: Vec<&str> = Vec::new();

        if let Some(symbol) = &filter.symbol {
            sql.push_str(" AND symbol = ?");
            binds.push(symbol);
        }
        if let Some(timeframe) = &filter.timeframe {
            sql.push_str(" AND timeframe = ?");
            binds.push(timeframe);
        }
        if let Some(pattern_type) = &filter.pattern_type {
            sql.push_str(" AND pattern_type = ?");
            binds.push(pattern_type);
        }
        if filter.job_id.is_some() {
            sql.push_str(" AND job_id = ?");
        }
        sql.push_str(" ORDER BY id ASC");

        let mut query = sqlx::query_as::<_, RunRecord>(&sql).bind(filter.min_trades);
        for b in binds {
            query = query.bind(b);
        }
        if let Some(job_id) = filter.job_id {
            query = query.bind(job_id);
        }

        let records = query.fetch_all(self.pool).await?;
        Ok(records)
    }

    /// Completed runs whose stored scope is exactly this range, newest first.
    /// Matches on the current `end_ts`, so runs extended past `end_ts` drop out.
    pub async fn completed_in_range(
        &self,
        symbol: &str,
        timeframe: &str,
        pattern_type: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> DbResult<Vec<RunRecord>> {
        let records = sqlx::query_as::<_, RunRecord>(
            r#"SELECT * FROM optimization_runs
               WHERE symbol = ?1 AND timeframe = ?2 AND pattern_type = ?3
                 AND start_ts = ?4 AND end_ts = ?5 AND status = 'completed'
               ORDER BY updated_at DESC, id DESC"#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(pattern_type)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// (status, count) pairs for a job
    pub async fn status_counts(&self, job_id: i64) -> DbResult<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM optimization_runs WHERE job_id = ?1 GROUP BY status ORDER BY status",
        )
        .bind(job_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::repository::jobs::{JobRepository, NewJob};
    use crate::{now_rfc3339, Database};

    pub(crate) fn run_record(key: &str) -> RunRecord {
        RunRecord {
            id: None,
            job_id: 0,
            run_key: key.into(),
            symbol: "BTC/USDT".into(),
            timeframe: "1h".into(),
            pattern_type: "fvg".into(),
            start_ts: 0,
            end_ts: 86_400_000,
            params_json: "{}".into(),
            status: "pending".into(),
            total_trades: 0,
            wins: 0,
            losses: 0,
            expired: 0,
            win_rate: "0".into(),
            avg_rr: "0".into(),
            total_profit_pct: "0".into(),
            max_drawdown: "0".into(),
            sharpe_ratio: "0".into(),
            profit_factor: "0".into(),
            avg_duration: "0".into(),
            stats_state_json: "{}".into(),
            trades_json: "[]".into(),
            open_trades_json: "[]".into(),
            pending_entries_json: "[]".into(),
            last_candle_ts: None,
            invocations: 0,
            error_kind: None,
            error_message: None,
            updated_at: now_rfc3339(),
        }
    }

    async fn seeded(db: &Database, keys: &[&str]) -> i64 {
        let runs: Vec<RunRecord> = keys.iter().map(|k| run_record(k)).collect();
        let job = NewJob {
            name: "seed".into(),
            scope_json: "{}".into(),
            grid_json: "{}".into(),
            metric: "win_rate".into(),
        };
        JobRepository::new(db.pool()).create(&job, &runs).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_batch_updates_in_place() {
        let db = Database::in_memory().await.unwrap();
        let job_id = seeded(&db, &["a", "b", "c"]).await;
        let repo = RunRepository::new(db.pool());

        let mut done = run_record("a");
        done.job_id = job_id;
        done.status = "completed".into();
        done.total_trades = 12;
        done.win_rate = "0.5".into();
        done.last_candle_ts = Some(42);
        done.invocations = 1;

        let mut failed = run_record("b");
        failed.job_id = job_id;
        failed.status = "failed".into();
        failed.error_kind = Some("data".into());
        failed.error_message = Some("no usable candles".into());

        assert_eq!(repo.save_batch(&[done, failed]).await.unwrap(), 2);

        let runs = repo.list_for_job(job_id).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].last_candle_ts, Some(42));
        assert_eq!(runs[1].error_kind.as_deref(), Some("data"));
        assert_eq!(runs[2].status, "pending");

        let counts = repo.status_counts(job_id).await.unwrap();
        assert_eq!(
            counts,
            vec![
                ("completed".to_string(), 1),
                ("failed".to_string(), 1),
                ("pending".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_completed_filters() {
        let db = Database::in_memory().await.unwrap();
        let job_id = seeded(&db, &["a", "b"]).await;
        let repo = RunRepository::new(db.pool());

        let mut a = run_record("a");
        a.job_id = job_id;
        a.status = "completed".into();
        a.total_trades = 15;
        let mut b = run_record("b");
        b.job_id = job_id;
        b.status = "completed".into();
        b.total_trades = 3;
        b.timeframe = "4h".into();
        repo.save_batch(&[a, b]).await.unwrap();

        let all = repo.completed(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let enough = repo
            .completed(&RunFilter {
                min_trades: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(enough.len(), 1);
        assert_eq!(enough[0].run_key, "a");

        let by_scope = repo
            .completed(&RunFilter {
                job_id: Some(job_id),
                symbol: Some("BTC/USDT".into()),
                timeframe: Some("4h".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_scope.len(), 1);
        assert_eq!(by_scope[0].run_key, "b");

        assert!(repo
            .completed(&RunFilter {
                job_id: Some(job_id + 1),
                ..Default::default()
            })
            .await
            .unwrap()
            .is_empty());

        let in_range = repo
            .completed_in_range("BTC/USDT", "1h", "fvg", 0, 86_400_000)
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].total_trades, 15);
        assert!(repo
            .completed_in_range("BTC/USDT", "1h", "fvg", 0, 2 * 86_400_000)
            .await
            .unwrap()
            .is_empty());
    }
}
