//! Storage seam for strategies, iterations and the loop config

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use persistence::repository::{
    ConfigRepository, IterationRecord, IterationRepository, StrategyRecord, StrategyRepository,
};
use persistence::SqlitePool;
use tracing::warn;

use crate::types::{Iteration, RefinementConfig, Strategy};

/// What the refinement loop needs from storage
#[async_trait]
pub trait IterationStore: Send + Sync {
    async fn get_strategy(&self, id: &str) -> anyhow::Result<Option<Strategy>>;
    async fn save_strategy(&self, strategy: &Strategy) -> anyhow::Result<()>;
    async fn save_iteration(&self, iteration: &Iteration) -> anyhow::Result<()>;
    /// Newest first
    async fn recent_iterations(&self, strategy_id: &str, limit: usize) -> anyhow::Result<Vec<Iteration>>;
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_strategies(&self) -> anyhow::Result<Vec<Strategy>> {
        StrategyRepository::new(&self.pool)
            .list()
            .await?
            .into_iter()
            .map(Strategy::try_from)
            .collect()
    }

    /// Returns `false` if the strategy did not exist
    pub async fn delete_strategy(&self, id: &str) -> anyhow::Result<bool> {
        Ok(StrategyRepository::new(&self.pool).delete(id).await?)
    }

    pub async fn latest_iteration(&self, strategy_id: &str) -> anyhow::Result<Option<Iteration>> {
        IterationRepository::new(&self.pool)
            .get_latest(strategy_id)
            .await?
            .map(Iteration::try_from)
            .transpose()
    }

    /// Stored config, or defaults when none was saved or the stored document is unreadable
    pub async fn load_config(&self) -> anyhow::Result<RefinementConfig> {
        let Some(data) = ConfigRepository::new(&self.pool).get().await? else {
            return Ok(RefinementConfig::default());
        };

        match serde_json::from_str(&data) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(error = %e, "Stored config is invalid, using defaults");
                Ok(RefinementConfig::default())
            }
        }
    }

    pub async fn save_config(&self, config: &RefinementConfig) -> anyhow::Result<()> {
        let data = serde_json::to_string(config)?;
        ConfigRepository::new(&self.pool).save(&data).await?;
        Ok(())
    }
}

#[async_trait]
impl IterationStore for SqliteStore {
    async fn get_strategy(&self, id: &str) -> anyhow::Result<Option<Strategy>> {
        StrategyRepository::new(&self.pool)
            .get(id)
            .await?
            .map(Strategy::try_from)
            .transpose()
    }

    async fn save_strategy(&self, strategy: &Strategy) -> anyhow::Result<()> {
        StrategyRepository::new(&self.pool)
            .save(&StrategyRecord::from(strategy))
            .await?;
        Ok(())
    }

    async fn save_iteration(&self, iteration: &Iteration) -> anyhow::Result<()> {
        let record = IterationRecord::try_from(iteration)?;
        IterationRepository::new(&self.pool).save(&record).await?;
        Ok(())
    }

    async fn recent_iterations(&self, strategy_id: &str, limit: usize) -> anyhow::Result<Vec<Iteration>> {
        IterationRepository::new(&self.pool)
            .get_recent(strategy_id, limit as i64)
            .await?
            .into_iter()
            .map(Iteration::try_from)
            .collect()
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let ts = DateTime::parse_from_rfc3339(raw).with_context(|| format!("Invalid timestamp: {raw}"))?;
    Ok(ts.with_timezone(&Utc))
}

impl From<&Strategy> for StrategyRecord {
    fn from(s: &Strategy) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            code: s.code.clone(),
            description: s.description.clone(),
            created_at: format_timestamp(&s.created_at),
            current_version: s.current_version as i64,
            qc_project_id: s.qc_project_id.clone(),
            best_sharpe: s.best_sharpe,
            best_version: s.best_version as i64,
        }
    }
}

impl TryFrom<StrategyRecord> for Strategy {
    type Error = anyhow::Error;

    fn try_from(r: StrategyRecord) -> anyhow::Result<Self> {
        Ok(Self {
            created_at: parse_timestamp(&r.created_at)?,
            id: r.id,
            name: r.name,
            code: r.code,
            description: r.description,
            current_version: u32::try_from(r.current_version)?,
            qc_project_id: r.qc_project_id,
            best_sharpe: r.best_sharpe,
            best_version: u32::try_from(r.best_version)?,
        })
    }
}

impl TryFrom<&Iteration> for IterationRecord {
    type Error = anyhow::Error;

    fn try_from(i: &Iteration) -> anyhow::Result<Self> {
        Ok(Self {
            id: i.id.clone(),
            strategy_id: i.strategy_id.clone(),
            version: i.version as i64,
            timestamp: format_timestamp(&i.timestamp),
            backtest_result: serde_json::to_string(&i.backtest_result)?,
            analysis: serde_json::to_string(&i.analysis)?,
            code_before: i.code_before.clone(),
            code_after: i.code_after.clone(),
            improvement: i.improvement,
        })
    }
}

impl TryFrom<IterationRecord> for Iteration {
    type Error = anyhow::Error;

    fn try_from(r: IterationRecord) -> anyhow::Result<Self> {
        let backtest_result = serde_json::from_str(&r.backtest_result)
            .with_context(|| format!("Corrupt backtest result in iteration {}", r.id))?;
        let analysis = serde_json::from_str(&r.analysis)
            .with_context(|| format!("Corrupt analysis in iteration {}", r.id))?;

        Ok(Self {
            timestamp: parse_timestamp(&r.timestamp)?,
            version: u32::try_from(r.version)?,
            backtest_result,
            analysis,
            id: r.id,
            strategy_id: r.strategy_id,
            code_before: r.code_before,
            code_after: r.code_after,
            improvement: r.improvement,
        })
    }
}
