//! Domain types for the refinement engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A trading algorithm under refinement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Bumped by exactly one per applied iteration, never decremented
    pub current_version: u32,
    /// Remote backtesting project this strategy is compiled and run in
    pub qc_project_id: Option<String>,
    /// Write-once at creation; the loop does not update these
    pub best_sharpe: f64,
    pub best_version: u32,
}

/// `{prefix}_YYYYMMDD_HHMMSS_xxxx` with a random hex suffix
pub fn new_id(prefix: &str) -> String {
    format!(
        "{}_{}_{:04x}",
        prefix,
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::random::<u16>()
    )
}

impl Strategy {
    pub fn new(id: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            code: code.into(),
            description: None,
            created_at: Utc::now(),
            current_version: 1,
            qc_project_id: None,
            best_sharpe: 0.0,
            best_version: 1,
        }
    }
}

/// Outcome of one remote backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub backtest_id: String,
    #[serde(default)]
    pub sharpe_ratio: f64,
    #[serde(default)]
    pub max_drawdown: f64,
    #[serde(default)]
    pub total_return: f64,
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default)]
    pub trade_count: u64,
    #[serde(default = "default_trade_duration")]
    pub avg_trade_duration: String,
    /// Unparsed service payload, kept for audit
    #[serde(default)]
    pub raw_data: serde_json::Value,
}

fn default_trade_duration() -> String {
    "0".to_string()
}

/// Model confidence that a proposed change will help
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid confidence: {}", s)),
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

// Models are not consistent about casing ("High", "medium")
impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One change proposed by the diagnosis step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedChange {
    /// parameter | logic | filter | exit | entry
    #[serde(rename = "type", alias = "category", default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rationale: String,
}

/// Model diagnosis of a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub diagnosis: String,
    pub hypothesis: String,
    pub suggested_changes: Vec<SuggestedChange>,
    pub confidence: Confidence,
    pub risk_assessment: String,
}

/// A single applied refinement step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub strategy_id: String,
    /// Strategy version the change was generated from
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub backtest_result: BacktestResult,
    pub analysis: AnalysisResult,
    pub code_before: String,
    pub code_after: String,
    pub improvement: f64,
}

/// Metric the loop tries to improve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusMetric {
    #[default]
    Sharpe,
    Drawdown,
    Return,
    /// Any unrecognised selector; yields no improvement signal
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for FocusMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sharpe => write!(f, "sharpe"),
            Self::Drawdown => write!(f, "drawdown"),
            Self::Return => write!(f, "return"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for FocusMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sharpe" => Ok(Self::Sharpe),
            "drawdown" => Ok(Self::Drawdown),
            "return" => Ok(Self::Return),
            _ => Err(format!("Invalid focus metric: {}", s)),
        }
    }
}

/// Settings for the refinement loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// None = unlimited
    pub max_iterations: Option<u32>,
    /// Seconds between iterations
    pub backtest_cooldown: u64,
    /// Absolute improvement below which an iteration counts as a plateau
    pub improvement_threshold: f64,
    pub focus_metric: FocusMetric,
    pub auto_stop_on_plateau: bool,

    // Exploration knobs (persisted, not read by the loop)
    pub max_code_changes_per_iteration: u32,
    pub preserve_winning_logic: bool,
    pub exploration_rate: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            backtest_cooldown: 60,
            improvement_threshold: 0.01,
            focus_metric: FocusMetric::Sharpe,
            auto_stop_on_plateau: true,
            max_code_changes_per_iteration: 3,
            preserve_winning_logic: true,
            exploration_rate: 0.2,
        }
    }
}

/// Partial update of [`RefinementConfig`]; absent fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub max_iterations: Option<u32>,
    pub backtest_cooldown: Option<u64>,
    pub improvement_threshold: Option<f64>,
    pub focus_metric: Option<FocusMetric>,
    pub auto_stop_on_plateau: Option<bool>,
    pub max_code_changes_per_iteration: Option<u32>,
    pub preserve_winning_logic: Option<bool>,
    pub exploration_rate: Option<f64>,
}

impl RefinementConfig {
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(v) = update.max_iterations {
            self.max_iterations = Some(v);
        }
        if let Some(v) = update.backtest_cooldown {
            self.backtest_cooldown = v;
        }
        if let Some(v) = update.improvement_threshold {
            self.improvement_threshold = v;
        }
        if let Some(v) = update.focus_metric {
            self.focus_metric = v;
        }
        if let Some(v) = update.auto_stop_on_plateau {
            self.auto_stop_on_plateau = v;
        }
        if let Some(v) = update.max_code_changes_per_iteration {
            self.max_code_changes_per_iteration = v;
        }
        if let Some(v) = update.preserve_winning_logic {
            self.preserve_winning_logic = v;
        }
        if let Some(v) = update.exploration_rate {
            self.exploration_rate = v;
        }
    }
}

/// Snapshot of the running loop, published to the facade
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopState {
    pub running: bool,
    pub paused: bool,
    pub current_strategy_id: Option<String>,
    pub iteration_count: u32,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: RefinementConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RefinementConfig::default());
        assert_eq!(config.backtest_cooldown, 60);
        assert_eq!(config.improvement_threshold, 0.01);
        assert!(config.auto_stop_on_plateau);
    }

    #[test]
    fn test_unknown_focus_metric_is_accepted() {
        let config: RefinementConfig =
            serde_json::from_str(r#"{"focus_metric": "sortino"}"#).unwrap();
        assert_eq!(config.focus_metric, FocusMetric::Unknown);
    }

    #[test]
    fn test_config_update_only_touches_given_fields() {
        let mut config = RefinementConfig::default();
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"backtest_cooldown": 5, "focus_metric": "drawdown"}"#).unwrap();
        config.apply(update);

        assert_eq!(config.backtest_cooldown, 5);
        assert_eq!(config.focus_metric, FocusMetric::Drawdown);
        assert_eq!(config.improvement_threshold, 0.01);
        assert_eq!(config.max_iterations, None);
    }

    #[test]
    fn test_confidence_is_case_insensitive() {
        let c: Confidence = serde_json::from_str(r#""High""#).unwrap();
        assert_eq!(c, Confidence::High);
        assert!(serde_json::from_str::<Confidence>(r#""certain""#).is_err());
        assert_eq!(serde_json::to_string(&Confidence::Medium).unwrap(), r#""medium""#);
    }

    #[test]
    fn test_new_id_format() {
        let id = new_id("iter");
        assert!(id.starts_with("iter_"));
        // iter_ + 8 date + _ + 6 time + _ + 4 hex
        assert_eq!(id.len(), 5 + 8 + 1 + 6 + 1 + 4);
        assert!(new_id("strat").starts_with("strat_"));
    }

    #[test]
    fn test_suggested_change_reads_type_field() {
        let change: SuggestedChange = serde_json::from_str(
            r#"{"type": "exit", "description": "tighten stop", "rationale": "cut losers"}"#,
        )
        .unwrap();
        assert_eq!(change.category, "exit");
        assert_eq!(change.rationale, "cut losers");
    }
}
