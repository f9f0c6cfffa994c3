//! Prompt templates for the diagnosis and code-generation model calls

use crate::evaluator::format_pct;
use crate::types::{AnalysisResult, BacktestResult, RefinementConfig, Strategy};

/// Ask the model to diagnose a backtest and propose one testable change (JSON reply)
pub fn diagnosis_prompt(
    strategy: &Strategy,
    result: &BacktestResult,
    history_context: &str,
    config: &RefinementConfig,
) -> String {
    format!(
        r#"You are analyzing trading strategy backtest results for autonomous refinement.

## Strategy
Name: {name}
Description: {description}

## Current Backtest Results
Sharpe Ratio: {sharpe:.3}
Max Drawdown: {drawdown}
Total Return: {total_return}
Win Rate: {win_rate}
Trade Count: {trades}
Avg Trade Duration: {duration}

## Previous Iterations
{history_context}

## Focus Metric
Primary optimization target: {focus}
Improvement threshold: {threshold}

## Current Code
```python
{code}
```

Analyze these results and provide:
1. DIAGNOSIS: What is the single biggest weakness or opportunity for improvement?
2. HYPOTHESIS: A specific, testable change to address the diagnosis
3. CONFIDENCE: Your confidence level (low/medium/high) that this change will improve the focus metric
4. RISK: Any risks or potential negative effects of this change

Respond in JSON format:
{{
    "diagnosis": "string describing the main issue",
    "hypothesis": "string describing the proposed change",
    "suggested_changes": [
        {{
            "type": "parameter|logic|filter|exit|entry",
            "description": "what to change",
            "rationale": "why this should help"
        }}
    ],
    "confidence": "low|medium|high",
    "risk_assessment": "string describing potential downsides"
}}
"#,
        name = strategy.name,
        description = strategy.description.as_deref().unwrap_or("N/A"),
        sharpe = result.sharpe_ratio,
        drawdown = format_pct(result.max_drawdown, 2),
        total_return = format_pct(result.total_return, 2),
        win_rate = format_pct(result.win_rate, 2),
        trades = result.trade_count,
        duration = result.avg_trade_duration,
        history_context = history_context,
        focus = config.focus_metric,
        threshold = format_pct(config.improvement_threshold, 1),
        code = strategy.code,
    )
}

/// Ask the model to rewrite the algorithm according to a diagnosis (code-only reply)
pub fn code_prompt(strategy: &Strategy, analysis: &AnalysisResult, result: &BacktestResult) -> String {
    let changes = serde_json::to_string_pretty(&analysis.suggested_changes)
        .unwrap_or_else(|_| "[]".to_string());

    format!(
        r##"You are modifying a QuantConnect Lean trading algorithm based on analysis.

## Current Code
```python
{code}
```

## Analysis
Diagnosis: {diagnosis}
Hypothesis: {hypothesis}
Suggested Changes: {changes}

## Current Performance
Sharpe: {sharpe:.3}
Max DD: {drawdown}
Win Rate: {win_rate}

## Instructions
1. Implement the suggested changes
2. Keep changes minimal and focused on the hypothesis
3. Preserve all existing functionality unless explicitly changing it
4. Add a comment noting the change (e.g., "# v{next_version}: adjusted X for Y")
5. Ensure the code remains valid QuantConnect Lean Python

Return ONLY the complete updated code, no explanations. The code must be syntactically valid and ready to compile.
"##,
        code = strategy.code,
        diagnosis = analysis.diagnosis,
        hypothesis = analysis.hypothesis,
        changes = changes,
        sharpe = result.sharpe_ratio,
        drawdown = format_pct(result.max_drawdown, 2),
        win_rate = format_pct(result.win_rate, 2),
        next_version = strategy.current_version + 1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::tests::result;
    use crate::types::{Confidence, FocusMetric, SuggestedChange};

    fn strategy() -> Strategy {
        let mut s = Strategy::new("strat_1", "Mean Reverter", "class Algo(QCAlgorithm): pass");
        s.current_version = 3;
        s
    }

    #[test]
    fn test_diagnosis_prompt_contains_metrics_and_context() {
        let config = RefinementConfig {
            focus_metric: FocusMetric::Drawdown,
            ..Default::default()
        };
        let prompt = diagnosis_prompt(&strategy(), &result(1.2346, 0.1234, 0.2), "v2: ...", &config);

        assert!(prompt.contains("Name: Mean Reverter"));
        assert!(prompt.contains("Description: N/A"));
        assert!(prompt.contains("Sharpe Ratio: 1.235"));
        assert!(prompt.contains("Max Drawdown: 12.34%"));
        assert!(prompt.contains("Total Return: 20.00%"));
        assert!(prompt.contains("## Previous Iterations\nv2: ..."));
        assert!(prompt.contains("Primary optimization target: drawdown"));
        assert!(prompt.contains("Improvement threshold: 1.0%"));
        assert!(prompt.contains("```python\nclass Algo(QCAlgorithm): pass\n```"));
        assert!(prompt.contains(r#""confidence": "low|medium|high","#));
    }

    #[test]
    fn test_code_prompt_annotates_next_version() {
        let analysis = AnalysisResult {
            diagnosis: "Too many trades".to_string(),
            hypothesis: "Raise entry threshold".to_string(),
            suggested_changes: vec![SuggestedChange {
                category: "parameter".to_string(),
                description: "rsi 30 -> 25".to_string(),
                rationale: "fewer false signals".to_string(),
            }],
            confidence: Confidence::High,
            risk_assessment: "Miss some entries".to_string(),
        };
        let prompt = code_prompt(&strategy(), &analysis, &result(1.0, 0.05, 0.1));

        assert!(prompt.contains("# v4: adjusted X for Y"));
        assert!(prompt.contains("Preserve all existing functionality unless explicitly changing it"));
        assert!(prompt.contains(r#""type": "parameter""#));
        assert!(prompt.contains("Max DD: 5.00%"));
        assert!(prompt.contains("Return ONLY the complete updated code"));
    }
}
