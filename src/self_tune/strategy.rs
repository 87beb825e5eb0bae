//! # Stage: Strategy Selector
//!
//! ## Responsibility
//! Picks the adaptation strategy for a task from its snapshot history and a
//! per-task escalation ladder:
//!
//! ```text
//!   Stable ──degrading──► Tuning ──tune failed (within lookback)──► Escalated
//!     ▲                     │                                          │
//!     └──────── improved ───┴──────────────── improved ────────────────┘
//! ```
//!
//! ## Guarantees
//! - Deterministic: the same history, ladder state and timestamps always give
//!   the same strategy
//! - Bounded: each task keeps at most `max_attempts` attempt records
//!
//! ## NOT Responsible For
//! - Producing the concrete change (that is the generator)
//! - Judging whether an attempt improved anything (the control loop reports it)

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::self_tune::metric_store::MetricSnapshot;

// ---------------------------------------------------------------------------
// Strategy + ladder state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    HyperparameterTune,
    ArchitectureAdjust,
    NoOp,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::HyperparameterTune => write!(f, "hyperparameter_tune"),
            Strategy::ArchitectureAdjust => write!(f, "architecture_adjust"),
            Strategy::NoOp => write!(f, "no_op"),
        }
    }
}

/// Position on the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LadderState {
    #[default]
    Stable,
    Tuning,
    Escalated,
}

impl fmt::Display for LadderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LadderState::Stable => write!(f, "stable"),
            LadderState::Tuning => write!(f, "tuning"),
            LadderState::Escalated => write!(f, "escalated"),
        }
    }
}

/// Shape of the recent score trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Degrading,
    Flat,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Drop of the latest score below the history peak that counts as degrading.
    pub degradation_drop: f64,
    /// A failed tuning attempt older than this no longer forces escalation.
    pub lookback_ms: u64,
    /// Snapshots examined for a monotonic improvement.
    pub trend_len: usize,
    pub max_attempts: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            degradation_drop: 0.05,
            lookback_ms: 60 * 60 * 1_000,
            trend_len: 3,
            max_attempts: 32,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-task ladder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Attempt {
    strategy: Strategy,
    at_ms: u64,
    improved: bool,
}

#[derive(Debug, Default)]
struct TaskLadder {
    state: LadderState,
    attempts: VecDeque<Attempt>,
}

// ---------------------------------------------------------------------------
// StrategySelector
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StrategySelector {
    config: StrategyConfig,
    ladders: Mutex<HashMap<String, TaskLadder>>,
}

impl StrategySelector {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config, ladders: Mutex::new(HashMap::new()) }
    }

    /// Classify the trend of `history` (oldest first).
    ///
    /// Fewer than two snapshots means no baseline; that is treated as
    /// degrading because a cycle only starts once something has fired.
    pub fn trend(&self, history: &[MetricSnapshot]) -> Trend {
        if history.len() < 2 {
            return Trend::Degrading;
        }
        let n = self.config.trend_len.clamp(2, history.len());
        let recent = &history[history.len() - n..];
        if recent.windows(2).all(|w| w[1].score > w[0].score) {
            return Trend::Improving;
        }
        let peak = history.iter().map(|s| s.score).fold(f64::NEG_INFINITY, f64::max);
        let latest = history[history.len() - 1].score;
        if peak - latest > self.config.degradation_drop {
            Trend::Degrading
        } else {
            Trend::Flat
        }
    }

    /// Choose a strategy for `task_id`.  `now_ms` is the cycle's trigger time.
    pub fn select(&self, task_id: &str, history: &[MetricSnapshot], now_ms: u64) -> Strategy {
        let trend = self.trend(history);
        let Ok(mut ladders) = self.ladders.lock() else { return Strategy::NoOp };
        let ladder = ladders.entry(task_id.to_string()).or_default();

        let strategy = match (trend, ladder.state) {
            (Trend::Improving, _) => Strategy::NoOp,
            (Trend::Flat, LadderState::Stable) => Strategy::NoOp,
            (_, LadderState::Stable) => {
                ladder.state = LadderState::Tuning;
                Strategy::HyperparameterTune
            }
            (_, LadderState::Tuning) => {
                let failed_recently = ladder.attempts.iter().any(|a| {
                    a.strategy == Strategy::HyperparameterTune
                        && !a.improved
                        && now_ms.saturating_sub(a.at_ms) <= self.config.lookback_ms
                });
                if failed_recently {
                    ladder.state = LadderState::Escalated;
                    Strategy::ArchitectureAdjust
                } else {
                    Strategy::HyperparameterTune
                }
            }
            (_, LadderState::Escalated) => Strategy::ArchitectureAdjust,
        };

        tracing::debug!(
            target: "governor::strategy",
            task_id,
            ?trend,
            state = %ladder.state,
            %strategy,
            "strategy selected"
        );
        strategy
    }

    /// Record the outcome of an attempt.  Success returns the ladder to `Stable`.
    pub fn report(&self, task_id: &str, strategy: Strategy, improved: bool, at_ms: u64) {
        if strategy == Strategy::NoOp {
            return;
        }
        if let Ok(mut ladders) = self.ladders.lock() {
            let ladder = ladders.entry(task_id.to_string()).or_default();
            if ladder.attempts.len() >= self.config.max_attempts.max(1) {
                ladder.attempts.pop_front();
            }
            ladder.attempts.push_back(Attempt { strategy, at_ms, improved });
            if improved {
                ladder.state = LadderState::Stable;
            }
        }
    }

    /// Operator reset: back to `Stable` with no attempt history.
    pub fn reset(&self, task_id: &str) {
        if let Ok(mut ladders) = self.ladders.lock() {
            ladders.insert(task_id.to_string(), TaskLadder::default());
        }
        tracing::info!(target: "governor::strategy", task_id, "escalation ladder reset");
    }

    pub fn state(&self, task_id: &str) -> LadderState {
        self.ladders
            .lock()
            .ok()
            .and_then(|l| l.get(task_id).map(|t| t.state))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
