//! Iteration repository: append-only refinement history

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted refinement iteration.
/// `backtest_result` and `analysis` hold JSON documents.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IterationRecord {
    pub id: String,
    pub strategy_id: String,
    pub version: i64,
    pub timestamp: String,
    pub backtest_result: String,
    pub analysis: String,
    pub code_before: String,
    pub code_after: String,
    pub improvement: f64,
}

/// Repository for iterations
pub struct IterationRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> IterationRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an iteration (fails if the id already exists)
    pub async fn save(&self, record: &IterationRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO iterations
                (id, strategy_id, version, timestamp, backtest_result,
                 analysis, code_before, code_after, improvement)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&record.id)
        .bind(&record.strategy_id)
        .bind(record.version)
        .bind(&record.timestamp)
        .bind(&record.backtest_result)
        .bind(&record.analysis)
        .bind(&record.code_before)
        .bind(&record.code_after)
        .bind(record.improvement)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Most recent iterations for a strategy, newest first
    pub async fn get_recent(&self, strategy_id: &str, limit: i64) -> DbResult<Vec<IterationRecord>> {
        let records = sqlx::query_as::<_, IterationRecord>(
            r#"SELECT id, strategy_id, version, timestamp, backtest_result,
                      analysis, code_before, code_after, improvement
               FROM iterations
               WHERE strategy_id = ?1
               ORDER BY timestamp DESC, rowid DESC
               LIMIT ?2"#,
        )
        .bind(strategy_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// The newest iteration for a strategy, if any
    pub async fn get_latest(&self, strategy_id: &str) -> DbResult<Option<IterationRecord>> {
        Ok(self.get_recent(strategy_id, 1).await?.into_iter().next())
    }
}
