//! Config repository: single-row JSON document for the refinement loop settings

use crate::DbResult;
use sqlx::SqlitePool;

pub struct ConfigRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConfigRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Stored config document, if one was ever saved
    pub async fn get(&self) -> DbResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM config WHERE id = 1")
            .fetch_optional(self.pool)
            .await?;

        Ok(row.map(|(data,)| data))
    }

    /// Replace the stored config document
    pub async fn save(&self, data: &str) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO config (id, data) VALUES (1, ?1)
               ON CONFLICT(id) DO UPDATE SET data = excluded.data"#,
        )
        .bind(data)
        .execute(self.pool)
        .await?;

        Ok(())
    }
}
