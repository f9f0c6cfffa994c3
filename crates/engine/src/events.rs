//! Lifecycle events emitted by the refinement loop

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

/// Pipeline phase announced with a `phase` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Backtesting,
    Analyzing,
    GeneratingCode,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backtesting => "backtesting",
            Self::Analyzing => "analyzing",
            Self::GeneratingCode => "generating_code",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    LoopStarted { strategy_id: String, strategy_name: String },
    IterationStarted { iteration_id: String, iteration_number: u32 },
    Phase(Phase),
    BacktestFailed { reason: String },
    BacktestComplete { sharpe: f64, max_drawdown: f64, total_return: f64 },
    AnalysisComplete { diagnosis: String, suggested_changes: usize },
    IterationComplete { iteration_id: String, improvement: f64, new_version: u32 },
    Cooldown { seconds: u64 },
    PlateauDetected { message: String },
    MaxIterationsReached { count: u32 },
    Error { message: String },
    LoopStopped { total_iterations: u32 },
}

impl LoopEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoopStarted { .. } => "loop_started",
            Self::IterationStarted { .. } => "iteration_started",
            Self::Phase(_) => "phase",
            Self::BacktestFailed { .. } => "backtest_failed",
            Self::BacktestComplete { .. } => "backtest_complete",
            Self::AnalysisComplete { .. } => "analysis_complete",
            Self::IterationComplete { .. } => "iteration_complete",
            Self::Cooldown { .. } => "cooldown",
            Self::PlateauDetected { .. } => "plateau_detected",
            Self::MaxIterationsReached { .. } => "max_iterations_reached",
            Self::Error { .. } => "error",
            Self::LoopStopped { .. } => "loop_stopped",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::LoopStarted {
                strategy_id,
                strategy_name,
            } => json!({ "strategy_id": strategy_id, "strategy_name": strategy_name }),
            Self::IterationStarted {
                iteration_id,
                iteration_number,
            } => json!({ "iteration_id": iteration_id, "iteration_number": iteration_number }),
            Self::Phase(phase) => json!({ "phase": phase.as_str() }),
            Self::BacktestFailed { reason } => json!({ "reason": reason }),
            Self::BacktestComplete {
                sharpe,
                max_drawdown,
                total_return,
            } => json!({
                "sharpe": sharpe,
                "max_drawdown": max_drawdown,
                "total_return": total_return,
            }),
            Self::AnalysisComplete {
                diagnosis,
                suggested_changes,
            } => json!({ "diagnosis": diagnosis, "suggested_changes": suggested_changes }),
            Self::IterationComplete {
                iteration_id,
                improvement,
                new_version,
            } => json!({
                "iteration_id": iteration_id,
                "improvement": improvement,
                "new_version": new_version,
            }),
            Self::Cooldown { seconds } => json!({ "seconds": seconds }),
            Self::PlateauDetected { message } => json!({ "message": message }),
            Self::MaxIterationsReached { count } => json!({ "count": count }),
            Self::Error { message } => json!({ "message": message }),
            Self::LoopStopped { total_iterations } => json!({ "total_iterations": total_iterations }),
        }
    }

    /// Wire form sent to listeners
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event: self.name().to_string(),
            data: self.data(),
        }
    }
}

/// `{"event": ..., "data": {...}}`
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event: String,
    pub data: Value,
}

/// Receives loop events. Must not block and must not fail.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LoopEvent);
}

/// Fans events out to any number of subscribers (WebSocket clients, CLI printer)
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &LoopEvent) {
        debug!(event = event.name(), data = %event.data(), "Loop event");
        // No subscribers is fine
        let _ = self.tx.send(event.envelope());
    }
}
