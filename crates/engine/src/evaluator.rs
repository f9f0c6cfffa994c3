//! Improvement scoring, plateau detection and the bounded iteration history

use std::collections::VecDeque;

use crate::types::{BacktestResult, FocusMetric, Iteration};

/// Iterations kept in memory for scoring and prompt context
pub const HISTORY_WINDOW: usize = 10;
/// Iterations rendered into the diagnosis prompt
pub const PROMPT_CONTEXT_SIZE: usize = 5;
/// Consecutive plateau iterations that end the loop (when auto-stop is on)
pub const PLATEAU_LIMIT: u32 = 3;

const HYPOTHESIS_PREVIEW_CHARS: usize = 50;

/// Relative change of the focus metric against the previous backtest.
/// Positive means better. Zero when there is no previous result or no usable baseline.
pub fn compute_improvement(
    current: &BacktestResult,
    previous: Option<&BacktestResult>,
    focus: FocusMetric,
) -> f64 {
    let Some(prev) = previous else {
        return 0.0;
    };

    match focus {
        FocusMetric::Sharpe => {
            relative_to(current.sharpe_ratio - prev.sharpe_ratio, prev.sharpe_ratio)
        }
        // Lower drawdown is better
        FocusMetric::Drawdown => {
            relative_to(prev.max_drawdown - current.max_drawdown, prev.max_drawdown)
        }
        FocusMetric::Return => {
            relative_to(current.total_return - prev.total_return, prev.total_return)
        }
        FocusMetric::Unknown => 0.0,
    }
}

fn relative_to(delta: f64, baseline: f64) -> f64 {
    if baseline == 0.0 {
        return 0.0;
    }
    let change = delta / baseline.abs();
    if change.is_finite() {
        change
    } else {
        0.0
    }
}

/// True iff the improvement is smaller in magnitude than the threshold
pub fn is_plateau(improvement: f64, threshold: f64) -> bool {
    improvement.abs() < threshold
}

/// Counts consecutive plateau iterations
#[derive(Debug, Default, Clone, Copy)]
pub struct PlateauTracker {
    consecutive: u32,
}

impl PlateauTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an iteration's improvement; returns the current streak length
    pub fn record(&mut self, improvement: f64, threshold: f64) -> u32 {
        if is_plateau(improvement, threshold) {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.consecutive
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn limit_reached(&self) -> bool {
        self.consecutive >= PLATEAU_LIMIT
    }
}

/// Sliding window of the most recent iterations, oldest first
#[derive(Debug, Clone, Default)]
pub struct IterationHistory {
    items: VecDeque<Iteration>,
}

impl IterationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a newest-first listing (as returned by storage)
    pub fn from_newest_first(iterations: Vec<Iteration>) -> Self {
        let mut history = Self::new();
        for iteration in iterations.into_iter().take(HISTORY_WINDOW).rev() {
            history.push(iteration);
        }
        history
    }

    pub fn push(&mut self, iteration: Iteration) {
        self.items.push_back(iteration);
        while self.items.len() > HISTORY_WINDOW {
            self.items.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&Iteration> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Improvement of `current` over the newest iteration in the window
    pub fn improvement(&self, current: &BacktestResult, focus: FocusMetric) -> f64 {
        compute_improvement(current, self.latest().map(|i| &i.backtest_result), focus)
    }

    /// One line per recent iteration for the diagnosis prompt
    pub fn render_context(&self) -> String {
        if self.items.is_empty() {
            return "No previous iterations".to_string();
        }

        let skip = self.items.len().saturating_sub(PROMPT_CONTEXT_SIZE);
        self.items
            .iter()
            .skip(skip)
            .map(|iteration| {
                let result = &iteration.backtest_result;
                let preview: String = iteration
                    .analysis
                    .hypothesis
                    .chars()
                    .take(HYPOTHESIS_PREVIEW_CHARS)
                    .collect();
                format!(
                    "v{}: Sharpe {:.3}, DD {}, WR {} | Change: {}...",
                    iteration.version,
                    result.sharpe_ratio,
                    format_pct(result.max_drawdown, 2),
                    format_pct(result.win_rate, 2),
                    preview
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Render a fraction as a percentage, e.g. 0.1234 -> "12.34%"
pub fn format_pct(fraction: f64, decimals: usize) -> String {
    format!("{:.*}%", decimals, fraction * 100.0)
}
