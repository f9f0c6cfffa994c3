//! Autonomous refinement loop: backtest, diagnose, regenerate, persist, repeat.
//!
//! One [`RefinementLoop`] drives one strategy on a single tokio task. Callers steer it
//! through a [`LoopHandle`] (pause / resume / stop), read its [`LoopState`] snapshots and
//! push config changes through a [`ConfigHandle`]; [`RefinementSession`] bundles all three
//! with the task's join handle.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backtest::BacktestOrchestrator;
use crate::evaluator::{IterationHistory, PlateauTracker, HISTORY_WINDOW};
use crate::events::{EventSink, LoopEvent, Phase};
use crate::llm::{self, LanguageModel};
use crate::store::IterationStore;
use crate::types::{
    new_id, BacktestResult, ConfigUpdate, Iteration, LoopState, RefinementConfig, Strategy,
};

const PLATEAU_MESSAGE: &str = "Performance has plateaued, stopping loop";

/// How a loop run ended
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    /// Stop was requested
    Stopped,
    /// `max_iterations` was reached
    LimitReached,
    /// Auto-stop after consecutive plateau iterations
    Plateau,
    /// A model or storage failure ended the loop
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default)]
struct ControlState {
    paused: bool,
    stopped: bool,
}

/// Pause / resume / stop for a running loop. Flags are observed at the next checkpoint;
/// an iteration already in flight runs to completion.
#[derive(Clone)]
pub struct LoopHandle {
    control: Arc<watch::Sender<ControlState>>,
    status: Arc<watch::Sender<LoopState>>,
}

impl LoopHandle {
    pub fn pause(&self) {
        self.control.send_modify(|c| c.paused = true);
        self.status.send_modify(|s| s.paused = true);
    }

    pub fn resume(&self) {
        self.control.send_modify(|c| c.paused = false);
        self.status.send_modify(|s| s.paused = false);
    }

    pub fn stop(&self) {
        self.control.send_modify(|c| c.stopped = true);
    }
}

/// Live loop settings, read by the loop at each point of use
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<RefinementConfig>>,
}

impl ConfigHandle {
    pub fn new(config: RefinementConfig) -> Self {
        let (tx, _) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> RefinementConfig {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, config: RefinementConfig) {
        self.tx.send_replace(config);
    }

    /// Merge a partial update and return the resulting config
    pub fn apply(&self, update: ConfigUpdate) -> RefinementConfig {
        self.tx.send_modify(|config| config.apply(update));
        self.get()
    }
}

pub struct RefinementLoop {
    orchestrator: BacktestOrchestrator,
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn IterationStore>,
    events: Arc<dyn EventSink>,
    config: ConfigHandle,
    handle: LoopHandle,
    control: watch::Receiver<ControlState>,
    history: IterationHistory,
    plateau: PlateauTracker,
    iteration_count: u32,
}

impl RefinementLoop {
    pub fn new(
        orchestrator: BacktestOrchestrator,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn IterationStore>,
        events: Arc<dyn EventSink>,
        config: RefinementConfig,
    ) -> Self {
        let (control_tx, control) = watch::channel(ControlState::default());
        let (status_tx, _) = watch::channel(LoopState::default());

        Self {
            orchestrator,
            model,
            store,
            events,
            config: ConfigHandle::new(config),
            handle: LoopHandle {
                control: Arc::new(control_tx),
                status: Arc::new(status_tx),
            },
            control,
            history: IterationHistory::new(),
            plateau: PlateauTracker::new(),
            iteration_count: 0,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn config_handle(&self) -> ConfigHandle {
        self.config.clone()
    }

    pub fn status(&self) -> watch::Receiver<LoopState> {
        self.handle.status.subscribe()
    }

    /// Run on a new task
    pub fn spawn(self, strategy: Strategy) -> RefinementSession {
        self.mark_running(&strategy);
        let handle = self.handle();
        let status = self.status();
        let config = self.config_handle();
        let strategy_id = strategy.id.clone();
        let task = tokio::spawn(self.run(strategy));

        RefinementSession {
            strategy_id,
            handle,
            status,
            config,
            task,
        }
    }

    /// Refine `strategy` until stopped, a limit is hit, or a fatal failure.
    /// `loop_stopped` is always the last event emitted.
    pub async fn run(mut self, mut strategy: Strategy) -> LoopOutcome {
        info!(
            strategy_id = %strategy.id,
            name = %strategy.name,
            project_id = ?strategy.qc_project_id,
            version = strategy.current_version,
            "Starting refinement loop"
        );
        self.mark_running(&strategy);

        let outcome = match self.drive(&mut strategy).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("{e:#}");
                error!(strategy_id = %strategy.id, error = %message, "Refinement loop failed");
                self.events.emit(&LoopEvent::Error {
                    message: message.clone(),
                });
                self.handle
                    .status
                    .send_modify(|s| s.last_error = Some(message.clone()));
                LoopOutcome::Failed(message)
            }
        };

        self.handle.status.send_modify(|s| {
            s.running = false;
            s.paused = false;
        });
        self.events.emit(&LoopEvent::LoopStopped {
            total_iterations: self.iteration_count,
        });
        info!(
            strategy_id = %strategy.id,
            iterations = self.iteration_count,
            outcome = ?outcome,
            "Refinement loop stopped"
        );
        outcome
    }

    fn mark_running(&self, strategy: &Strategy) {
        self.handle.status.send_modify(|s| {
            s.running = true;
            s.current_strategy_id = Some(strategy.id.clone());
            s.iteration_count = self.iteration_count;
            s.last_error = None;
        });
    }

    async fn drive(&mut self, strategy: &mut Strategy) -> anyhow::Result<LoopOutcome> {
        let stored = self
            .store
            .recent_iterations(&strategy.id, HISTORY_WINDOW)
            .await?;
        self.history = IterationHistory::from_newest_first(stored);

        self.events.emit(&LoopEvent::LoopStarted {
            strategy_id: strategy.id.clone(),
            strategy_name: strategy.name.clone(),
        });

        loop {
            if !self.wait_until_runnable().await {
                return Ok(LoopOutcome::Stopped);
            }

            // Zero means unlimited
            if let Some(max) = self.config.get().max_iterations.filter(|m| *m > 0) {
                if self.iteration_count >= max {
                    info!(count = self.iteration_count, max, "Iteration limit reached");
                    self.events.emit(&LoopEvent::MaxIterationsReached {
                        count: self.iteration_count,
                    });
                    return Ok(LoopOutcome::LimitReached);
                }
            }

            if let Some(iteration) = self.run_iteration(strategy).await? {
                self.iteration_count += 1;
                let count = self.iteration_count;
                self.handle.status.send_modify(|s| s.iteration_count = count);

                let config = self.config.get();
                let streak = self.plateau.record(iteration.improvement, config.improvement_threshold);
                self.history.push(iteration);

                if streak > 0 {
                    info!(streak, "Improvement below threshold");
                }
                if config.auto_stop_on_plateau && self.plateau.limit_reached() {
                    warn!(streak, "Plateau detected");
                    self.events.emit(&LoopEvent::PlateauDetected {
                        message: PLATEAU_MESSAGE.to_string(),
                    });
                    return Ok(LoopOutcome::Plateau);
                }
            }

            let seconds = self.config.get().backtest_cooldown;
            self.events.emit(&LoopEvent::Cooldown { seconds });
            self.cooldown(Duration::from_secs(seconds)).await;
        }
    }

    /// Block while paused. Returns `false` once stop has been requested.
    async fn wait_until_runnable(&mut self) -> bool {
        let current = *self.control.borrow();
        if current.paused && !current.stopped {
            info!("Loop paused");
        }

        let stopped = match self.control.wait_for(|c| c.stopped || !c.paused).await {
            Ok(state) => state.stopped,
            Err(_) => true,
        };
        !stopped
    }

    /// Sleep between cycles; a stop request cuts it short
    async fn cooldown(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.control.wait_for(|c| c.stopped) => {}
        }
    }

    /// One backtest, diagnose, regenerate, persist cycle.
    /// `Ok(None)` when the backtest produced no result.
    async fn run_iteration(&mut self, strategy: &mut Strategy) -> anyhow::Result<Option<Iteration>> {
        let iteration_id = new_id("iter");
        self.events.emit(&LoopEvent::IterationStarted {
            iteration_id: iteration_id.clone(),
            iteration_number: self.iteration_count + 1,
        });

        self.events.emit(&LoopEvent::Phase(Phase::Backtesting));
        let backtest = match self.backtest(strategy).await {
            Ok(result) => result,
            Err(reason) => {
                self.events.emit(&LoopEvent::BacktestFailed { reason });
                return Ok(None);
            }
        };
        self.events.emit(&LoopEvent::BacktestComplete {
            sharpe: backtest.sharpe_ratio,
            max_drawdown: backtest.max_drawdown,
            total_return: backtest.total_return,
        });

        self.events.emit(&LoopEvent::Phase(Phase::Analyzing));
        let analysis = llm::diagnose(
            self.model.as_ref(),
            strategy,
            &backtest,
            &self.history.render_context(),
            &self.config.get(),
        )
        .await?;
        self.events.emit(&LoopEvent::AnalysisComplete {
            diagnosis: analysis.diagnosis.clone(),
            suggested_changes: analysis.suggested_changes.len(),
        });

        self.events.emit(&LoopEvent::Phase(Phase::GeneratingCode));
        let new_code = llm::synthesize(self.model.as_ref(), strategy, &analysis, &backtest).await?;

        let improvement = self
            .history
            .improvement(&backtest, self.config.get().focus_metric);
        let iteration = Iteration {
            id: iteration_id.clone(),
            strategy_id: strategy.id.clone(),
            version: strategy.current_version,
            timestamp: Utc::now(),
            backtest_result: backtest,
            analysis,
            code_before: strategy.code.clone(),
            code_after: new_code.clone(),
            improvement,
        };
        self.store.save_iteration(&iteration).await?;

        strategy.code = new_code;
        strategy.current_version += 1;
        self.store.save_strategy(strategy).await?;

        self.handle.status.send_modify(|s| s.last_update = Some(Utc::now()));
        info!(
            iteration_id = %iteration_id,
            improvement,
            new_version = strategy.current_version,
            "Iteration complete"
        );
        self.events.emit(&LoopEvent::IterationComplete {
            iteration_id,
            improvement,
            new_version: strategy.current_version,
        });

        Ok(Some(iteration))
    }

    /// Backtest the current source; the error is a human-readable reason
    async fn backtest(&self, strategy: &Strategy) -> Result<BacktestResult, String> {
        let Some(project_id) = strategy.qc_project_id.as_deref() else {
            warn!(strategy_id = %strategy.id, "Strategy has no remote project");
            return Err("Strategy has no QuantConnect project".to_string());
        };

        let label = format!("Refinement v{}", strategy.current_version);
        self.orchestrator
            .run_backtest(project_id, &strategy.code, &label)
            .await
            .map_err(|e| {
                if e.is_recoverable() {
                    warn!(strategy_id = %strategy.id, error = %e, "Backtest failed");
                } else {
                    error!(strategy_id = %strategy.id, error = %e, "Backtest failed");
                }
                e.to_string()
            })
    }
}

/// A loop running on its own task
pub struct RefinementSession {
    strategy_id: String,
    handle: LoopHandle,
    status: watch::Receiver<LoopState>,
    config: ConfigHandle,
    task: JoinHandle<LoopOutcome>,
}

impl RefinementSession {
    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn state(&self) -> LoopState {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished() && self.status.borrow().running
    }

    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Wait for the loop task to finish
    pub async fn wait(self) -> LoopOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => LoopOutcome::Failed(format!("Loop task aborted: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::tests::{fast_settings, FakeRemote};
    use crate::backtest::{BacktestStatus, CompileState};
    use crate::evaluator::tests::{iteration, result};
    use crate::events::tests::RecordingSink;
    use crate::llm::DIAGNOSIS_MAX_TOKENS;
    use crate::store::tests::memory_store;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const DIAGNOSIS_REPLY: &str = r#"Here is my analysis:
```json
{
  "diagnosis": "Entries fire too often",
  "hypothesis": "Tighten the RSI entry band",
  "suggested_changes": [
    {"type": "parameter", "description": "rsi 30 -> 25", "rationale": "fewer false entries"}
  ],
  "confidence": "medium",
  "risk_assessment": "Fewer trades"
}
```"#;

    /// Answers diagnosis and code prompts; optionally fails every call
    #[derive(Default)]
    struct FakeModel {
        fail: bool,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                anyhow::bail!("model unavailable");
            }
            if max_tokens == DIAGNOSIS_MAX_TOKENS {
                Ok(DIAGNOSIS_REPLY.to_string())
            } else {
                let n = self.prompts.lock().unwrap().len();
                Ok(format!("```python\nclass Algo(QCAlgorithm):\n    # revision {n}\n    pass\n```"))
            }
        }
    }

    fn completed(sharpe: f64) -> BacktestStatus {
        BacktestStatus {
            completed: true,
            payload: json!({"sharpeRatio": sharpe, "drawdown": 0.1, "totalPerformance": 0.2}),
        }
    }

    fn remote_with(sharpes: &[f64]) -> Arc<FakeRemote> {
        let remote = FakeRemote::default();
        remote
            .backtest_polls
            .lock()
            .unwrap()
            .extend(sharpes.iter().map(|s| completed(*s)));
        Arc::new(remote)
    }

    fn fast_config() -> RefinementConfig {
        RefinementConfig {
            backtest_cooldown: 0,
            ..Default::default()
        }
    }

    async fn seeded_store(version: u32) -> (Arc<SqliteStore>, Strategy) {
        let store = Arc::new(memory_store().await);
        let mut strategy = Strategy::new("strat", "RSI Reverter", "class Algo(QCAlgorithm): pass");
        strategy.current_version = version;
        strategy.qc_project_id = Some("p1".to_string());
        store.save_strategy(&strategy).await.unwrap();
        (store, strategy)
    }

    fn build(
        remote: Arc<FakeRemote>,
        model: Arc<FakeModel>,
        store: Arc<SqliteStore>,
        sink: Arc<RecordingSink>,
        config: RefinementConfig,
    ) -> RefinementLoop {
        RefinementLoop::new(
            BacktestOrchestrator::with_settings(remote, fast_settings()),
            model,
            store,
            sink,
            config,
        )
    }

    /// Poll the recorder until `name` shows up (bounded)
    async fn wait_for_event(sink: &RecordingSink, name: &str) {
        for _ in 0..400 {
            if sink.names().contains(&name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event {name} never emitted: {:?}", sink.names());
    }

    #[tokio::test]
    async fn test_improving_iteration_bumps_version() {
        let (store, strategy) = seeded_store(3).await;
        let mut prior = iteration(2, result(1.0, 0.1, 0.2));
        prior.analysis.hypothesis = "Widen stops".to_string();
        store.save_iteration(&prior).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let model = Arc::new(FakeModel::default());
        let config = RefinementConfig {
            max_iterations: Some(1),
            ..fast_config()
        };
        let refinement = build(remote_with(&[1.1]), model.clone(), store.clone(), sink.clone(), config);
        let status = refinement.status();

        let outcome = refinement.run(strategy).await;
        assert_eq!(outcome, LoopOutcome::LimitReached);

        assert_eq!(
            sink.names(),
            vec![
                "loop_started",
                "iteration_started",
                "phase",
                "backtest_complete",
                "phase",
                "analysis_complete",
                "phase",
                "iteration_complete",
                "cooldown",
                "max_iterations_reached",
                "loop_stopped",
            ]
        );

        let events = sink.events();
        let Some(LoopEvent::IterationComplete {
            improvement,
            new_version,
            ..
        }) = events.iter().find(|e| e.name() == "iteration_complete")
        else {
            panic!("no iteration_complete");
        };
        assert!((improvement - 0.1).abs() < 1e-9);
        assert_eq!(*new_version, 4);
        assert!(events.contains(&LoopEvent::AnalysisComplete {
            diagnosis: "Entries fire too often".to_string(),
            suggested_changes: 1,
        }));
        assert_eq!(events.last(), Some(&LoopEvent::LoopStopped { total_iterations: 1 }));

        let saved = store.get_strategy("strat").await.unwrap().unwrap();
        assert_eq!(saved.current_version, 4);
        assert!(saved.code.contains("# revision 2"));

        let recent = store.recent_iterations("strat", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].version, 3);
        assert_eq!(recent[0].code_before, "class Algo(QCAlgorithm): pass");
        assert_eq!(recent[0].analysis.hypothesis, "Tighten the RSI entry band");

        let prompts = model.prompts.lock().unwrap().clone();
        assert!(prompts[0].contains("v2: Sharpe 1.000, DD 10.00%, WR 50.00% | Change: Widen stops..."));
        assert!(prompts[1].contains("# v4: adjusted X for Y"));

        let state = status.borrow().clone();
        assert!(!state.running);
        assert_eq!(state.iteration_count, 1);
        assert!(state.last_update.is_some());
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_three_plateau_iterations_stop_the_loop() {
        let (store, strategy) = seeded_store(1).await;
        let sink = Arc::new(RecordingSink::default());
        let refinement = build(
            remote_with(&[1.0, 1.0, 1.0, 1.0, 1.0]),
            Arc::new(FakeModel::default()),
            store.clone(),
            sink.clone(),
            fast_config(),
        );

        assert_eq!(refinement.run(strategy).await, LoopOutcome::Plateau);

        let names = sink.names();
        assert_eq!(names.iter().filter(|n| **n == "iteration_started").count(), 3);
        assert_eq!(names[names.len() - 2..], ["plateau_detected", "loop_stopped"]);
        assert_eq!(store.get_strategy("strat").await.unwrap().unwrap().current_version, 4);
    }

    #[tokio::test]
    async fn test_failed_backtest_does_not_break_plateau_streak() {
        let (store, strategy) = seeded_store(1).await;
        let sink = Arc::new(RecordingSink::default());
        let remote = remote_with(&[1.0, 1.0, 1.0]);
        // Second cycle fails to compile, the rest build cleanly
        remote.compile_states.lock().unwrap().extend([
            CompileState::Success,
            CompileState::BuildError,
            CompileState::Success,
            CompileState::Success,
        ]);
        let refinement = build(
            remote,
            Arc::new(FakeModel::default()),
            store.clone(),
            sink.clone(),
            fast_config(),
        );

        assert_eq!(refinement.run(strategy).await, LoopOutcome::Plateau);

        let names = sink.names();
        let cycle_ends: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| matches!(*n, "iteration_complete" | "backtest_failed"))
            .collect();
        assert_eq!(
            cycle_ends,
            vec![
                "iteration_complete",
                "backtest_failed",
                "iteration_complete",
                "iteration_complete",
            ]
        );
        assert_eq!(names.iter().filter(|n| **n == "iteration_started").count(), 4);
        assert_eq!(names[names.len() - 2..], ["plateau_detected", "loop_stopped"]);
        assert_eq!(
            sink.events().last(),
            Some(&LoopEvent::LoopStopped { total_iterations: 3 })
        );
        assert_eq!(store.get_strategy("strat").await.unwrap().unwrap().current_version, 4);
    }

    #[tokio::test]
    async fn test_plateau_without_auto_stop_keeps_going() {
        let (store, strategy) = seeded_store(1).await;
        let sink = Arc::new(RecordingSink::default());
        let config = RefinementConfig {
            auto_stop_on_plateau: false,
            max_iterations: Some(4),
            ..fast_config()
        };
        let refinement = build(
            remote_with(&[1.0, 1.0, 1.0, 1.0]),
            Arc::new(FakeModel::default()),
            store,
            sink.clone(),
            config,
        );

        assert_eq!(refinement.run(strategy).await, LoopOutcome::LimitReached);
        assert!(!sink.names().contains(&"plateau_detected"));
        assert!(sink
            .events()
            .contains(&LoopEvent::MaxIterationsReached { count: 4 }));
    }

    #[tokio::test]
    async fn test_backtest_timeout_skips_the_cycle() {
        let (store, strategy) = seeded_store(3).await;
        let sink = Arc::new(RecordingSink::default());
        let model = Arc::new(FakeModel::default());
        let config = RefinementConfig {
            backtest_cooldown: 60,
            ..Default::default()
        };
        // No completed polls: every backtest times out
        let refinement = build(
            Arc::new(FakeRemote::default()),
            model.clone(),
            store.clone(),
            sink.clone(),
            config,
        );
        let session = refinement.spawn(strategy);

        wait_for_event(&sink, "cooldown").await;
        session.stop();
        assert_eq!(session.wait().await, LoopOutcome::Stopped);

        assert_eq!(
            sink.names(),
            vec![
                "loop_started",
                "iteration_started",
                "phase",
                "backtest_failed",
                "cooldown",
                "loop_stopped",
            ]
        );
        let events = sink.events();
        let Some(LoopEvent::BacktestFailed { reason }) = events.get(3) else {
            panic!("expected backtest_failed");
        };
        assert!(reason.contains("did not complete"));

        assert!(model.prompts.lock().unwrap().is_empty());
        assert_eq!(store.get_strategy("strat").await.unwrap().unwrap().current_version, 3);
        assert!(store.recent_iterations("strat", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_project_is_a_failed_backtest() {
        let (store, mut strategy) = seeded_store(1).await;
        strategy.qc_project_id = None;
        let sink = Arc::new(RecordingSink::default());
        let remote = remote_with(&[1.0]);
        let refinement = build(
            remote.clone(),
            Arc::new(FakeModel::default()),
            store,
            sink.clone(),
            RefinementConfig {
                backtest_cooldown: 60,
                ..Default::default()
            },
        );
        let session = refinement.spawn(strategy);

        wait_for_event(&sink, "cooldown").await;
        session.stop();
        session.wait().await;

        assert!(sink.events().contains(&LoopEvent::BacktestFailed {
            reason: "Strategy has no QuantConnect project".to_string(),
        }));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_paused_exits_without_work() {
        let (store, strategy) = seeded_store(1).await;
        let sink = Arc::new(RecordingSink::default());
        let remote = remote_with(&[1.0]);
        let refinement = build(
            remote.clone(),
            Arc::new(FakeModel::default()),
            store,
            sink.clone(),
            fast_config(),
        );
        refinement.handle().pause();
        let session = refinement.spawn(strategy);

        wait_for_event(&sink, "loop_started").await;
        assert!(session.is_running());
        assert!(session.state().paused);

        session.stop();
        assert_eq!(session.wait().await, LoopOutcome::Stopped);
        assert_eq!(sink.names(), vec!["loop_started", "loop_stopped"]);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_is_fatal() {
        let (store, strategy) = seeded_store(2).await;
        let sink = Arc::new(RecordingSink::default());
        let model = Arc::new(FakeModel {
            fail: true,
            ..Default::default()
        });
        let refinement = build(remote_with(&[1.0]), model, store.clone(), sink.clone(), fast_config());
        let status = refinement.status();

        let outcome = refinement.run(strategy).await;
        assert!(matches!(outcome, LoopOutcome::Failed(ref m) if m.contains("model unavailable")));

        let names = sink.names();
        assert_eq!(names[names.len() - 2..], ["error", "loop_stopped"]);
        assert!(!names.contains(&"cooldown"));

        let state = status.borrow().clone();
        assert!(!state.running);
        assert!(state.last_error.unwrap().contains("model unavailable"));
        assert_eq!(store.get_strategy("strat").await.unwrap().unwrap().current_version, 2);
    }

    #[tokio::test]
    async fn test_config_update_reaches_running_loop() {
        let (store, strategy) = seeded_store(1).await;
        let sink = Arc::new(RecordingSink::default());
        let refinement = build(
            remote_with(&[1.0, 2.0, 3.0]),
            Arc::new(FakeModel::default()),
            store,
            sink.clone(),
            fast_config(),
        );
        refinement.handle().pause();
        let session = refinement.spawn(strategy);
        wait_for_event(&sink, "loop_started").await;

        let updated = session.config().apply(ConfigUpdate {
            max_iterations: Some(1),
            ..Default::default()
        });
        assert_eq!(updated.max_iterations, Some(1));
        session.resume();

        assert_eq!(session.wait().await, LoopOutcome::LimitReached);
        assert!(sink
            .events()
            .contains(&LoopEvent::MaxIterationsReached { count: 1 }));
    }
}
