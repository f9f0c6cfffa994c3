//! Remote backtest orchestration: push source, compile, submit, poll to completion
//!
//! The remote service is asynchronous: compiles and backtests are jobs that must be
//! polled. This module hides that protocol behind [`BacktestOrchestrator::run_backtest`],
//! which either yields a [`BacktestResult`] or a classified [`BacktestError`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::BacktestResult;

/// File the strategy source is uploaded as
pub const ALGORITHM_FILE: &str = "main.py";

/// State of a remote compile job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileState {
    Queued,
    Building,
    Success,
    BuildError,
    /// Any state label the service reports that we do not model
    Other(String),
}

impl CompileState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::BuildError)
    }
}

/// Compile job status as reported by the remote service
#[derive(Debug, Clone)]
pub struct CompileStatus {
    pub compile_id: String,
    pub state: CompileState,
    pub errors: Vec<String>,
}

/// Backtest job status as reported by the remote service
#[derive(Debug, Clone)]
pub struct BacktestStatus {
    pub completed: bool,
    /// Full result document; metrics are read from it once `completed` is set
    pub payload: Value,
}

/// Remote job-execution service (compile + backtest)
#[async_trait]
pub trait RemoteExecution: Send + Sync {
    async fn upload_file(&self, project_id: &str, name: &str, content: &str) -> anyhow::Result<()>;

    async fn create_compile(&self, project_id: &str) -> anyhow::Result<CompileStatus>;

    async fn read_compile(&self, project_id: &str, compile_id: &str) -> anyhow::Result<CompileStatus>;

    /// Returns the backtest id
    async fn create_backtest(
        &self,
        project_id: &str,
        compile_id: &str,
        name: &str,
    ) -> anyhow::Result<String>;

    async fn read_backtest(&self, project_id: &str, backtest_id: &str) -> anyhow::Result<BacktestStatus>;
}

/// Why a backtest produced no result
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Compilation failed: {}", .errors.join("; "))]
    CompilationFailed { errors: Vec<String> },

    #[error("Compilation did not finish after {attempts} polls")]
    CompilationTimeout { attempts: u32 },

    #[error("Backtest {backtest_id} did not complete within {timeout:?}")]
    BacktestTimeout { backtest_id: String, timeout: Duration },

    #[error("Remote service error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl BacktestError {
    /// Compile and timeout failures are expected outcomes of a cycle; transport errors are not
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

/// Polling cadence and bounds
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub compile_interval: Duration,
    pub compile_max_attempts: u32,
    pub backtest_interval: Duration,
    pub backtest_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            compile_interval: Duration::from_secs(1),
            compile_max_attempts: 30,
            backtest_interval: Duration::from_secs(5),
            backtest_timeout: Duration::from_secs(300),
        }
    }
}

/// Drives one strategy version through compile and backtest
#[derive(Clone)]
pub struct BacktestOrchestrator {
    remote: Arc<dyn RemoteExecution>,
    settings: PollSettings,
}

impl BacktestOrchestrator {
    pub fn new(remote: Arc<dyn RemoteExecution>) -> Self {
        Self::with_settings(remote, PollSettings::default())
    }

    pub fn with_settings(remote: Arc<dyn RemoteExecution>, settings: PollSettings) -> Self {
        Self { remote, settings }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Upload `source`, compile it and run a backtest labelled `label`
    pub async fn run_backtest(
        &self,
        project_id: &str,
        source: &str,
        label: &str,
    ) -> Result<BacktestResult, BacktestError> {
        info!(project_id, label, "Compiling strategy");
        self.remote.upload_file(project_id, ALGORITHM_FILE, source).await?;

        let compile_id = self.compile(project_id).await?;

        let backtest_id = self
            .remote
            .create_backtest(project_id, &compile_id, label)
            .await?;
        info!(project_id, backtest_id = %backtest_id, "Backtest submitted");

        let payload = self.wait_for_backtest(project_id, &backtest_id).await?;
        let result = extract_metrics(&backtest_id, payload);

        info!(
            backtest_id = %result.backtest_id,
            sharpe = result.sharpe_ratio,
            drawdown = result.max_drawdown,
            total_return = result.total_return,
            trades = result.trade_count,
            "Backtest complete"
        );
        Ok(result)
    }

    /// Request a compile and poll until it reaches a terminal state
    async fn compile(&self, project_id: &str) -> Result<String, BacktestError> {
        let created = self.remote.create_compile(project_id).await?;
        match created.state {
            CompileState::Success => return Ok(created.compile_id),
            CompileState::BuildError => {
                return Err(BacktestError::CompilationFailed {
                    errors: created.errors,
                })
            }
            _ => {}
        }

        let compile_id = created.compile_id;
        let attempts = self.settings.compile_max_attempts;

        for attempt in 1..=attempts {
            let status = self.remote.read_compile(project_id, &compile_id).await?;
            debug!(attempt, state = ?status.state, "Compile poll");

            match status.state {
                CompileState::Success => return Ok(compile_id),
                CompileState::BuildError => {
                    warn!(errors = ?status.errors, "Compilation failed");
                    return Err(BacktestError::CompilationFailed {
                        errors: status.errors,
                    });
                }
                _ => {}
            }

            tokio::time::sleep(self.settings.compile_interval).await;
        }

        warn!(compile_id = %compile_id, attempts, "Compilation timed out");
        Err(BacktestError::CompilationTimeout { attempts })
    }

    /// Poll the backtest until it reports completion or the timeout elapses
    async fn wait_for_backtest(&self, project_id: &str, backtest_id: &str) -> Result<Value, BacktestError> {
        let started = Instant::now();
        let timeout = self.settings.backtest_timeout;

        while started.elapsed() < timeout {
            let status = self.remote.read_backtest(project_id, backtest_id).await?;
            if status.completed {
                return Ok(status.payload);
            }
            debug!(backtest_id, elapsed = ?started.elapsed(), "Backtest still running");
            tokio::time::sleep(self.settings.backtest_interval).await;
        }

        warn!(backtest_id, ?timeout, "Backtest timed out");
        Err(BacktestError::BacktestTimeout {
            backtest_id: backtest_id.to_string(),
            timeout,
        })
    }
}

// ---------------------------------------------------------------------------
// Metric extraction
// ---------------------------------------------------------------------------

/// Map a completed backtest document into a [`BacktestResult`].
/// Missing or unreadable metrics become zero; the payload is kept verbatim.
pub fn extract_metrics(backtest_id: &str, payload: Value) -> BacktestResult {
    let sharpe_ratio = metric(&payload, "sharpeRatio", "Sharpe Ratio");
    let max_drawdown = metric(&payload, "drawdown", "Drawdown");
    let total_return = metric(&payload, "totalPerformance", "Net Profit");
    let win_rate = metric(&payload, "winRate", "Win Rate");
    let trade_count = metric(&payload, "totalOrders", "Total Orders").max(0.0) as u64;
    let avg_trade_duration = lookup(&payload, "averageTradeDuration", "Average Trade Duration")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "0".to_string());

    BacktestResult {
        backtest_id: backtest_id.to_string(),
        sharpe_ratio,
        max_drawdown,
        total_return,
        win_rate,
        trade_count,
        avg_trade_duration,
        raw_data: payload,
    }
}

/// Top-level camelCase key first, then the human-readable `statistics` entry
fn lookup<'a>(payload: &'a Value, key: &str, statistic: &str) -> Option<&'a Value> {
    payload
        .get(key)
        .filter(|v| !v.is_null())
        .or_else(|| payload.get("statistics").and_then(|s| s.get(statistic)))
}

fn metric(payload: &Value, key: &str, statistic: &str) -> f64 {
    lookup(payload, key, statistic).and_then(parse_number).unwrap_or(0.0)
}

/// Numbers pass through; strings like "1.25", "$1,000" or "55%" (-> 0.55) are parsed.
/// Non-finite values ("NaN", "inf") count as missing.
fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, ',' | '$' | ' '))
                .collect();
            match cleaned.strip_suffix('%') {
                Some(pct) => pct.parse::<f64>().ok().map(|v| v / 100.0),
                None => cleaned.parse::<f64>().ok(),
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}
