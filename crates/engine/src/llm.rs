//! Language model seam: the diagnosis and code-generation steps

use async_trait::async_trait;
use tracing::{debug, info};

use crate::extract::{extract_diagnosis, extract_source};
use crate::prompts::{code_prompt, diagnosis_prompt};
use crate::types::{AnalysisResult, BacktestResult, RefinementConfig, Strategy};

pub const DIAGNOSIS_MAX_TOKENS: u32 = 2000;
pub const CODE_MAX_TOKENS: u32 = 8000;

/// A text-completion model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String>;
}

/// Diagnose a backtest. Call failures propagate; unparsable replies fall back.
pub async fn diagnose(
    model: &dyn LanguageModel,
    strategy: &Strategy,
    result: &BacktestResult,
    history_context: &str,
    config: &RefinementConfig,
) -> anyhow::Result<AnalysisResult> {
    let prompt = diagnosis_prompt(strategy, result, history_context, config);
    let reply = model.complete(&prompt, DIAGNOSIS_MAX_TOKENS).await?;
    debug!(chars = reply.len(), "Diagnosis reply received");

    let analysis = extract_diagnosis(&reply);
    info!(
        confidence = %analysis.confidence,
        changes = analysis.suggested_changes.len(),
        hypothesis = %analysis.hypothesis,
        "Diagnosis ready"
    );
    Ok(analysis)
}

/// Regenerate the strategy source from a diagnosis
pub async fn synthesize(
    model: &dyn LanguageModel,
    strategy: &Strategy,
    analysis: &AnalysisResult,
    result: &BacktestResult,
) -> anyhow::Result<String> {
    let prompt = code_prompt(strategy, analysis, result);
    let reply = model.complete(&prompt, CODE_MAX_TOKENS).await?;
    let code = extract_source(&reply);
    debug!(lines = code.lines().count(), "Regenerated source extracted");
    Ok(code)
}
