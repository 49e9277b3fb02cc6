//! Persistence layer for the zone optimizer
//!
//! SQLite storage for candle history, production pattern zones, and
//! optimization jobs with their runs.

pub mod repository;
pub mod schema;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Pragmas applied to every connection pool. WAL lets API readers run while
/// the orchestrator commits a run batch; busy_timeout covers the remaining
/// lock hand-offs.
const PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode=WAL",
    "PRAGMA synchronous=NORMAL",
    "PRAGMA foreign_keys=ON",
    "PRAGMA busy_timeout=5000",
    // 8 MB page cache (negative = KiB)
    "PRAGMA cache_size=-8000",
];

/// Shared SQLite pool holding candles, production zones, jobs and runs
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db = Self::open(&format!("sqlite:{}?mode=rwc", path.display()), 5).await?;
        info!(path = %path.display(), "Database ready");
        Ok(db)
    }

    /// Single-connection in-memory database; every connection to
    /// `sqlite::memory:` would otherwise see its own empty schema
    pub async fn in_memory() -> DbResult<Self> {
        Self::open("sqlite::memory:", 1).await
    }

    async fn open(url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.configure_pragmas().await?;
        Ok(db)
    }

    /// Create tables, then apply column migrations
    async fn run_migrations(&self) -> DbResult<()> {
        for statement in schema::CREATE_TABLES.split(';') {
            let sql: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let sql = sql.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        // "duplicate column name" means the migration is already applied
        for migration in schema::MIGRATIONS {
            match sqlx::query(migration).execute(&self.pool).await {
                Ok(_) => debug!(migration, "Applied migration"),
                Err(e) if e.to_string().contains("duplicate column name") => {}
                Err(e) => return Err(DbError::Migration(format!("{e}: {migration}"))),
            }
        }

        Ok(())
    }

    async fn configure_pragmas(&self) -> DbResult<()> {
        for pragma in PRAGMAS {
            sqlx::query(pragma)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Connection(format!("{pragma} failed: {e}")))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Owned handle for storage adapters living in spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

/// Current UTC time as RFC 3339 text, the format of every `*_at` column
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_migrations_are_repeatable() {
        let db = Database::in_memory().await.unwrap();
        // second pass hits the duplicate-column path for ALTER migrations
        db.run_migrations().await.unwrap();

        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('candles', 'production_patterns', 'optimization_jobs', 'optimization_runs')",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, 4);
    }
}
