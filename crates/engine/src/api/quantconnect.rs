//! QuantConnect REST v2 client: file upload, compile and backtest jobs
//!
//! Every request carries a `Timestamp` header and a Basic `Authorization` header built from
//! the user id and `sha256(token:timestamp)`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::backtest::{BacktestStatus, CompileState, CompileStatus, RemoteExecution};

const DEFAULT_BASE_URL: &str = "https://www.quantconnect.com/api/v2";

/// Authenticated QuantConnect API client
#[derive(Clone)]
pub struct QuantConnectClient {
    client: Client,
    base_url: String,
    user_id: String,
    api_token: String,
}

impl QuantConnectClient {
    pub fn new(user_id: impl Into<String>, api_token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(user_id, api_token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        user_id: impl Into<String>,
        api_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            api_token: api_token.into(),
        })
    }

    /// From `QC_USER_ID`, `QC_API_TOKEN` and optionally `QC_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let user_id = std::env::var("QC_USER_ID").context("QC_USER_ID is not set")?;
        let api_token = std::env::var("QC_API_TOKEN").context("QC_API_TOKEN is not set")?;
        let base_url = std::env::var("QC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(user_id, api_token, base_url)
    }

    fn auth_headers(&self) -> (String, String) {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let hash = auth_hash(&self.api_token, &timestamp);
        (timestamp, format!("Basic {}:{}", self.user_id, hash))
    }

    async fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let (timestamp, authorization) = self.auth_headers();
        debug!(endpoint, "QuantConnect GET");

        let resp = self
            .client
            .get(&url)
            .header("Timestamp", timestamp)
            .header("Authorization", authorization)
            .query(params)
            .send()
            .await?;
        read_body(endpoint, resp).await
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let (timestamp, authorization) = self.auth_headers();
        debug!(endpoint, "QuantConnect POST");

        let resp = self
            .client
            .post(&url)
            .header("Timestamp", timestamp)
            .header("Authorization", authorization)
            .json(&body)
            .send()
            .await?;
        read_body(endpoint, resp).await
    }
}

async fn read_body(endpoint: &str, resp: reqwest::Response) -> Result<Value> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("QuantConnect {} error {}: {}", endpoint, status, body);
    }
    Ok(resp.json().await?)
}

/// Hex sha256 of `token:timestamp`
fn auth_hash(api_token: &str, timestamp: &str) -> String {
    let hash = Sha256::digest(format!("{}:{}", api_token, timestamp).as_bytes());
    format!("{:x}", hash)
}

fn errors_of(body: &Value) -> Vec<String> {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// An explicit `"success": false` is an error; a missing flag is not
fn ensure_success(endpoint: &str, body: &Value) -> Result<()> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        anyhow::bail!("QuantConnect {} rejected: {}", endpoint, errors_of(body).join("; "));
    }
    Ok(())
}

fn compile_state(label: &str) -> CompileState {
    match label {
        "InQueue" => CompileState::Queued,
        "Building" | "BuildInProgress" => CompileState::Building,
        "BuildSuccess" => CompileState::Success,
        "BuildError" => CompileState::BuildError,
        other => CompileState::Other(other.to_string()),
    }
}

fn compile_status(body: &Value, compile_id: &str) -> CompileStatus {
    CompileStatus {
        compile_id: body
            .get("compileId")
            .and_then(Value::as_str)
            .unwrap_or(compile_id)
            .to_string(),
        state: compile_state(body.get("state").and_then(Value::as_str).unwrap_or("")),
        errors: errors_of(body),
    }
}

#[async_trait]
impl RemoteExecution for QuantConnectClient {
    async fn upload_file(&self, project_id: &str, name: &str, content: &str) -> Result<()> {
        let body = self
            .post(
                "files/update",
                json!({ "projectId": project_id, "name": name, "content": content }),
            )
            .await?;
        ensure_success("files/update", &body)
    }

    async fn create_compile(&self, project_id: &str) -> Result<CompileStatus> {
        let body = self
            .post("compile/create", json!({ "projectId": project_id }))
            .await?;

        // A refused compile request is a build failure, not a transport fault
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Ok(CompileStatus {
                compile_id: String::new(),
                state: CompileState::BuildError,
                errors: errors_of(&body),
            });
        }
        Ok(compile_status(&body, ""))
    }

    async fn read_compile(&self, project_id: &str, compile_id: &str) -> Result<CompileStatus> {
        let body = self
            .get(
                "compile/read",
                &[("projectId", project_id), ("compileId", compile_id)],
            )
            .await?;
        Ok(compile_status(&body, compile_id))
    }

    async fn create_backtest(&self, project_id: &str, compile_id: &str, name: &str) -> Result<String> {
        let body = self
            .post(
                "backtests/create",
                json!({ "projectId": project_id, "compileId": compile_id, "backtestName": name }),
            )
            .await?;
        ensure_success("backtests/create", &body)?;

        body.get("backtestId")
            .or_else(|| body.get("backtest").and_then(|b| b.get("backtestId")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("QuantConnect backtests/create returned no backtestId")
    }

    async fn read_backtest(&self, project_id: &str, backtest_id: &str) -> Result<BacktestStatus> {
        let body = self
            .get(
                "backtests/read",
                &[("projectId", project_id), ("backtestId", backtest_id)],
            )
            .await?;
        ensure_success("backtests/read", &body)?;

        let backtest = body.get("backtest").cloned().unwrap_or(Value::Null);
        let completed = backtest
            .get("completed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(BacktestStatus {
            completed,
            payload: backtest,
        })
    }
}
