//! Refinery Engine: autonomous trading-strategy refinement
//!
//! Provides:
//! - Remote compile/backtest orchestration against QuantConnect
//! - Model-driven diagnosis and code regeneration (Anthropic)
//! - Improvement scoring and plateau detection
//! - The refinement loop with pause / resume / stop and live config

pub mod api;
pub mod backtest;
pub mod evaluator;
pub mod events;
pub mod extract;
pub mod llm;
pub mod prompts;
pub mod refinement;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use api::{AnthropicClient, QuantConnectClient};
pub use backtest::{
    extract_metrics, BacktestError, BacktestOrchestrator, BacktestStatus, CompileState,
    CompileStatus, PollSettings, RemoteExecution,
};
pub use evaluator::{compute_improvement, is_plateau, IterationHistory, PlateauTracker};
pub use events::{BroadcastSink, EventEnvelope, EventSink, LoopEvent, Phase};
pub use extract::{extract_diagnosis, extract_source, fallback_analysis};
pub use llm::LanguageModel;
pub use refinement::{ConfigHandle, LoopHandle, LoopOutcome, RefinementLoop, RefinementSession};
pub use store::{IterationStore, SqliteStore};
pub use types::*;
