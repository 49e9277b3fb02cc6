//! Production pattern store: zones persisted by live detection

use crate::{now_rfc3339, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ProductionPatternRecord {
    pub id: Option<i64>,
    pub symbol: String,
    pub timeframe: String,
    pub pattern_type: String,
    pub direction: String,
    pub zone_high: String,
    pub zone_low: String,
    pub detected_at: i64,
    pub context_json: Option<String>,
}

pub struct PatternRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PatternRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a zone (INSERT OR IGNORE on the zone's identity). Returns true if new.
    pub async fn save(&self, record: &ProductionPatternRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO production_patterns
                (symbol, timeframe, pattern_type, direction, zone_high, zone_low,
                 detected_at, context_json, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        )
        .bind(&record.symbol)
        .bind(&record.timeframe)
        .bind(&record.pattern_type)
        .bind(&record.direction)
        .bind(&record.zone_high)
        .bind(&record.zone_low)
        .bind(record.detected_at)
        .bind(&record.context_json)
        .bind(now_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Zones detected within `[start, end]`, oldest first
    pub async fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
        pattern_type: &str,
        start: i64,
        end: i64,
    ) -> DbResult<Vec<ProductionPatternRecord>> {
        let records = sqlx::query_as::<_, ProductionPatternRecord>(
            r#"SELECT id, symbol, timeframe, pattern_type, direction, zone_high, zone_low,
                      detected_at, context_json
               FROM production_patterns
               WHERE symbol = ?1 AND timeframe = ?2 AND pattern_type = ?3
                 AND detected_at >= ?4 AND detected_at <= ?5
               ORDER BY detected_at ASC, id ASC"#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(pattern_type)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
