//! Candle history repository

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CandleRecord {
    pub symbol: String,
    pub timeframe: String,
    /// Open time, epoch milliseconds
    pub timestamp: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

/// Stored range for one symbol/timeframe pair
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CandleSeriesSummary {
    pub symbol: String,
    pub timeframe: String,
    pub count: i64,
    pub first_ts: i64,
    pub last_ts: i64,
}

pub struct CandleRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CandleRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert candles in one transaction, skipping timestamps already stored.
    /// Returns the number of new rows.
    pub async fn insert_batch(&self, candles: &[CandleRecord]) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for candle in candles {
            let result = sqlx::query(
                r#"INSERT OR IGNORE INTO candles
                    (symbol, timeframe, timestamp, open, high, low, close, volume)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            )
            .bind(&candle.symbol)
            .bind(&candle.timeframe)
            .bind(candle.timestamp)
            .bind(&candle.open)
            .bind(&candle.high)
            .bind(&candle.low)
            .bind(&candle.close)
            .bind(&candle.volume)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Candles with `start <= timestamp <= end`, oldest first
    pub async fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
        start: i64,
        end: i64,
    ) -> DbResult<Vec<CandleRecord>> {
        let records = sqlx::query_as::<_, CandleRecord>(
            r#"SELECT symbol, timeframe, timestamp, open, high, low, close, volume
               FROM candles
               WHERE symbol = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
               ORDER BY timestamp ASC"#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    pub async fn series(&self) -> DbResult<Vec<CandleSeriesSummary>> {
        let records = sqlx::query_as::<_, CandleSeriesSummary>(
            r#"SELECT symbol, timeframe, COUNT(*) AS count,
                      MIN(timestamp) AS first_ts, MAX(timestamp) AS last_ts
               FROM candles
               GROUP BY symbol, timeframe
               ORDER BY symbol, timeframe"#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
