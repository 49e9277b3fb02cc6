//! Optimization job repository

use crate::repository::runs::{insert_run, RunRecord};
use crate::{now_rfc3339, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub scope_json: String,
    pub grid_json: String,
    pub metric: String,
    pub total_runs: i64,
    pub completed_runs: i64,
    pub failed_runs: i64,
    pub best_params_json: Option<String>,
    pub best_run_key: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Fields written when a job is created
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub scope_json: String,
    pub grid_json: String,
    pub metric: String,
}

/// Mutable fields of a job, written as a whole
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: String,
    pub scope_json: Option<String>,
    pub completed_runs: i64,
    pub failed_runs: i64,
    pub best_params_json: Option<String>,
    pub best_run_key: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

pub struct JobRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> JobRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a job with all its runs in one transaction; returns the job id
    pub async fn create(&self, job: &NewJob, runs: &[RunRecord]) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"INSERT INTO optimization_jobs
                (name, status, scope_json, grid_json, metric, total_runs, created_at)
               VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(&job.name)
        .bind(&job.scope_json)
        .bind(&job.grid_json)
        .bind(&job.metric)
        .bind(runs.len() as i64)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;
        let job_id = result.last_insert_rowid();

        for run in runs {
            let run = RunRecord {
                job_id,
                ..run.clone()
            };
            insert_run(&mut tx, &run).await?;
        }

        tx.commit().await?;
        Ok(job_id)
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM optimization_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    /// Most recent jobs first
    pub async fn list(&self, limit: i64) -> DbResult<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM optimization_jobs ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    pub async fn update(&self, id: i64, update: &JobUpdate) -> DbResult<()> {
        sqlx::query(
            r#"UPDATE optimization_jobs SET
                 status = ?1,
                 scope_json = COALESCE(?2, scope_json),
                 completed_runs = ?3,
                 failed_runs = ?4,
                 best_params_json = ?5,
                 best_run_key = ?6,
                 error_message = ?7,
                 started_at = COALESCE(?8, started_at),
                 finished_at = ?9
               WHERE id = ?10"#,
        )
        .bind(&update.status)
        .bind(&update.scope_json)
        .bind(update.completed_runs)
        .bind(update.failed_runs)
        .bind(&update.best_params_json)
        .bind(&update.best_run_key)
        .bind(&update.error_message)
        .bind(&update.started_at)
        .bind(&update.finished_at)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(())
    }
}
