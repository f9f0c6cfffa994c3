//! Strategy repository: the algorithms under refinement

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted strategy row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StrategyRecord {
    pub id: String,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub created_at: String,
    pub current_version: i64,
    pub qc_project_id: Option<String>,
    pub best_sharpe: f64,
    pub best_version: i64,
}

/// Repository for strategies
pub struct StrategyRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StrategyRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a strategy (upsert by id)
    pub async fn save(&self, record: &StrategyRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO strategies
                (id, name, code, description, created_at, current_version,
                 qc_project_id, best_sharpe, best_version)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 code = excluded.code,
                 description = excluded.description,
                 current_version = excluded.current_version,
                 qc_project_id = excluded.qc_project_id,
                 best_sharpe = excluded.best_sharpe,
                 best_version = excluded.best_version
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.code)
        .bind(&record.description)
        .bind(&record.created_at)
        .bind(record.current_version)
        .bind(&record.qc_project_id)
        .bind(record.best_sharpe)
        .bind(record.best_version)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Get a strategy by id
    pub async fn get(&self, id: &str) -> DbResult<Option<StrategyRecord>> {
        let record = sqlx::query_as::<_, StrategyRecord>(
            r#"SELECT id, name, code, description, created_at, current_version,
                      qc_project_id, best_sharpe, best_version
               FROM strategies WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// All strategies, newest first
    pub async fn list(&self) -> DbResult<Vec<StrategyRecord>> {
        let records = sqlx::query_as::<_, StrategyRecord>(
            r#"SELECT id, name, code, description, created_at, current_version,
                      qc_project_id, best_sharpe, best_version
               FROM strategies ORDER BY created_at DESC"#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Delete a strategy together with its iterations.
    /// Returns `false` if no strategy had this id.
    pub async fn delete(&self, id: &str) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM iterations WHERE strategy_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM strategies WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
