//! Extraction of structured diagnoses and source code from free-form model output

use crate::types::{AnalysisResult, Confidence};
use tracing::warn;

const FENCE: &str = "```";

/// A fenced block found in model output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fence<'a> {
    /// Language tag on the opening line, empty if none
    tag: &'a str,
    body: &'a str,
}

/// All fenced blocks in order. An unterminated fence runs to the end of the text.
fn fences(text: &str) -> Vec<Fence<'_>> {
    let mut found = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];

        // The tag is the first word of the opening line; a fence closed on the
        // same line is inline and untagged
        let (tag, body_start) = match after_open.find('\n') {
            Some(nl) if !after_open[..nl].contains(FENCE) => {
                let tag = after_open[..nl].split_whitespace().next().unwrap_or("");
                (tag, &after_open[nl + 1..])
            }
            _ => ("", after_open),
        };

        match body_start.find(FENCE) {
            Some(close) => {
                found.push(Fence {
                    tag,
                    body: &body_start[..close],
                });
                rest = &body_start[close + FENCE.len()..];
            }
            None => {
                found.push(Fence {
                    tag,
                    body: body_start,
                });
                break;
            }
        }
    }

    found
}

/// The fallback used whenever a diagnosis cannot be parsed
pub fn fallback_analysis() -> AnalysisResult {
    AnalysisResult {
        diagnosis: "Unable to parse detailed analysis".to_string(),
        hypothesis: "Consider parameter optimization".to_string(),
        suggested_changes: Vec::new(),
        confidence: Confidence::Low,
        risk_assessment: "Analysis parsing failed".to_string(),
    }
}

/// Parse a diagnosis out of model output.
///
/// Looks for a ```json block first, then any fenced block, then the whole text.
/// Never fails: unparsable output yields [`fallback_analysis`].
pub fn extract_diagnosis(raw: &str) -> AnalysisResult {
    let blocks = fences(raw);
    let candidate = blocks
        .iter()
        .find(|f| f.tag.eq_ignore_ascii_case("json"))
        .or_else(|| blocks.first())
        .map(|f| f.body)
        .unwrap_or(raw);

    match serde_json::from_str::<AnalysisResult>(candidate.trim()) {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!(error = %e, "Could not parse model diagnosis, using fallback");
            fallback_analysis()
        }
    }
}

/// Pull regenerated source out of model output.
///
/// Prefers a language-tagged fence, then any fence, then the whole text. Always trimmed.
pub fn extract_source(raw: &str) -> String {
    let blocks = fences(raw);
    let body = blocks
        .iter()
        .find(|f| !f.tag.is_empty())
        .or_else(|| blocks.first())
        .map(|f| f.body)
        .unwrap_or(raw);

    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SuggestedChange;

    const VALID_JSON: &str = r#"{
        "diagnosis": "Entries fire in choppy markets",
        "hypothesis": "Add an ADX filter above 25",
        "suggested_changes": [
            {"type": "filter", "description": "ADX > 25", "rationale": "avoid chop"}
        ],
        "confidence": "medium",
        "risk_assessment": "Fewer trades"
    }"#;

    #[test]
    fn test_diagnosis_from_json_fence() {
        let raw = format!("Here is my analysis:\n```json\n{}\n```\nGood luck!", VALID_JSON);
        let analysis = extract_diagnosis(&raw);

        assert_eq!(analysis.diagnosis, "Entries fire in choppy markets");
        assert_eq!(analysis.hypothesis, "Add an ADX filter above 25");
        assert_eq!(
            analysis.suggested_changes,
            vec![SuggestedChange {
                category: "filter".to_string(),
                description: "ADX > 25".to_string(),
                rationale: "avoid chop".to_string(),
            }]
        );
        assert_eq!(analysis.confidence, Confidence::Medium);
        assert_eq!(analysis.risk_assessment, "Fewer trades");
    }

    #[test]
    fn test_diagnosis_prefers_json_fence_over_earlier_block() {
        let raw = format!("```python\nprint('x')\n```\n```json\n{}\n```", VALID_JSON);
        assert_eq!(extract_diagnosis(&raw).confidence, Confidence::Medium);
    }

    #[test]
    fn test_diagnosis_from_bare_text() {
        let analysis = extract_diagnosis(VALID_JSON);
        assert_eq!(analysis.hypothesis, "Add an ADX filter above 25");
    }

    #[test]
    fn test_diagnosis_from_untagged_fence() {
        let raw = format!("```\n{}\n```", VALID_JSON);
        assert_eq!(extract_diagnosis(&raw).risk_assessment, "Fewer trades");
    }

    #[test]
    fn test_diagnosis_fallback_on_garbage() {
        let analysis = extract_diagnosis("I think the strategy is fine, no JSON today.");
        assert_eq!(analysis.diagnosis, "Unable to parse detailed analysis");
        assert_eq!(analysis.hypothesis, "Consider parameter optimization");
        assert!(analysis.suggested_changes.is_empty());
        assert_eq!(analysis.confidence, Confidence::Low);
        assert_eq!(analysis.risk_assessment, "Analysis parsing failed");
    }

    #[test]
    fn test_diagnosis_fallback_on_missing_field() {
        let raw = r#"```json
{"diagnosis": "d", "hypothesis": "h", "suggested_changes": [], "confidence": "high"}
```"#;
        assert_eq!(extract_diagnosis(raw), fallback_analysis());
    }

    #[test]
    fn test_diagnosis_fallback_on_bad_confidence() {
        let raw = r#"{"diagnosis": "d", "hypothesis": "h", "suggested_changes": [],
                      "confidence": "absolute", "risk_assessment": "r"}"#;
        assert_eq!(extract_diagnosis(raw), fallback_analysis());
    }

    #[test]
    fn test_source_from_tagged_fence() {
        assert_eq!(extract_source("prefix ```lang\nCODE\n``` suffix"), "CODE");
    }

    #[test]
    fn test_source_prefers_tagged_fence() {
        let raw = "```\nnot this\n```\nthen\n```python\nclass Algo:\n    pass\n```";
        assert_eq!(extract_source(raw), "class Algo:\n    pass");
    }

    #[test]
    fn test_source_from_untagged_fence() {
        assert_eq!(extract_source("```\n  x = 1\n```"), "x = 1");
    }

    #[test]
    fn test_source_without_fence_is_trimmed_input() {
        assert_eq!(extract_source("\n  class Algo:\n    pass  \n"), "class Algo:\n    pass");
    }

    #[test]
    fn test_source_unterminated_fence_runs_to_end() {
        assert_eq!(extract_source("```python\nx = 1\ny = 2\n"), "x = 1\ny = 2");
    }

    #[test]
    fn test_source_fence_with_info_string() {
        let raw = "Here you go:\n```python title=algo.py\nclass Algo:\n    pass\n```";
        assert_eq!(extract_source(raw), "class Algo:\n    pass");

        let blocks = fences(raw);
        assert_eq!(blocks[0].tag, "python");
    }

    #[test]
    fn test_inline_fence_before_newline_has_no_tag() {
        let blocks = fences("```x = 1 + 2```\nmore text");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].tag, "");
        assert_eq!(blocks[0].body, "x = 1 + 2");
    }

    #[test]
    fn test_inline_fence_has_no_tag() {
        let blocks = fences("```x = 1 + 2```");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].tag, "");
        assert_eq!(blocks[0].body, "x = 1 + 2");
    }
}
