//! # Stage: Feedback Aggregator
//!
//! ## Responsibility
//! Consumes resolved observations and decides when a task needs an
//! improvement cycle.  Fires on whichever comes first:
//!
//! 1. Degradation: the rolling error over the last `window_size` observations
//!    exceeds `degradation_threshold`
//! 2. Count budget: `count_budget` observations since the last cycle
//! 3. Time budget: `time_budget_ms` of observation time since the last cycle
//!
//! ## Guarantees
//! - At most one ticket per task until that task's cycle is resolved; every
//!   suppressed trigger is counted
//! - Deterministic: time is taken from observation timestamps, never the wall clock
//! - Thread-safe: one internal mutex, held only for the bookkeeping update
//!
//! ## NOT Responsible For
//! - Running the cycle (that is the control loop)
//! - Storing observations (that is the metric store)

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};
use crate::self_tune::metric_store::Observation;

// ---------------------------------------------------------------------------
// Trigger types
// ---------------------------------------------------------------------------

/// Why a cycle was started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TriggerReason {
    Degradation { rolling_error: f64, threshold: f64 },
    CountBudget { observations: u64 },
    TimeBudget { elapsed_ms: u64 },
    /// Operator request.
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Degradation { rolling_error, threshold } => {
                write!(f, "degradation ({rolling_error:.3} > {threshold:.3})")
            }
            TriggerReason::CountBudget { observations } => write!(f, "count_budget ({observations})"),
            TriggerReason::TimeBudget { elapsed_ms } => write!(f, "time_budget ({elapsed_ms}ms)"),
            TriggerReason::Manual => write!(f, "manual"),
        }
    }
}

/// Permission to run exactly one cycle for one task.  Deliberately not `Clone`.
#[derive(Debug, PartialEq)]
pub struct CycleTicket {
    pub task_id: String,
    pub reason: TriggerReason,
    /// Observation timestamp at which the trigger fired.
    pub issued_at_ms: u64,
}

/// Result of [`FeedbackAggregator::ingest`].
#[derive(Debug, PartialEq)]
pub enum TriggerDecision {
    None,
    Improve(CycleTicket),
}

impl TriggerDecision {
    pub fn is_improve(&self) -> bool {
        matches!(self, TriggerDecision::Improve(_))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Observations in the rolling error window.
    pub window_size: usize,
    /// Rolling mean error above which the task is degraded.
    pub degradation_threshold: f64,
    /// Fire after this many observations since the last cycle.  `None` disables.
    pub count_budget: Option<u64>,
    /// Fire after this much observation time since the last cycle.  `None` disables.
    pub time_budget_ms: Option<u64>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            degradation_threshold: 0.3,
            count_budget: Some(500),
            time_budget_ms: Some(60 * 60 * 1_000),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-task state
// ---------------------------------------------------------------------------

/// The last `cap` derived errors.
#[derive(Debug)]
struct ErrorWindow {
    values: VecDeque<f64>,
    cap: usize,
}

impl ErrorWindow {
    fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { values: VecDeque::with_capacity(cap), cap }
    }

    fn push(&mut self, error: f64) {
        if self.values.len() == self.cap {
            self.values.pop_front();
        }
        self.values.push_back(error);
    }

    fn is_full(&self) -> bool {
        self.values.len() == self.cap
    }

    fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}

#[derive(Debug)]
struct TaskFeedback {
    errors: ErrorWindow,
    since_cycle: u64,
    /// Timestamp the time budget is measured from.
    anchor_ms: Option<u64>,
    in_flight: bool,
    suppressed: u64,
}

impl TaskFeedback {
    fn new(window: usize) -> Self {
        Self {
            errors: ErrorWindow::new(window),
            since_cycle: 0,
            anchor_ms: None,
            in_flight: false,
            suppressed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// FeedbackAggregator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FeedbackAggregator {
    config: FeedbackConfig,
    tasks: Mutex<HashMap<String, TaskFeedback>>,
}

impl FeedbackAggregator {
    pub fn new(config: FeedbackConfig) -> Self {
        Self { config, tasks: Mutex::new(HashMap::new()) }
    }

    /// Feed one observation.  Pending (unresolved) observations are ignored.
    pub fn ingest(&self, obs: &Observation) -> TriggerDecision {
        let Some(error) = obs.error else { return TriggerDecision::None };
        let Ok(mut tasks) = self.tasks.lock() else { return TriggerDecision::None };
        let state = tasks
            .entry(obs.task_id.clone())
            .or_insert_with(|| TaskFeedback::new(self.config.window_size));

        state.errors.push(error);
        state.since_cycle += 1;
        let anchor = *state.anchor_ms.get_or_insert(obs.timestamp_ms);

        let reason = self.check(state, obs.timestamp_ms.saturating_sub(anchor));
        let Some(reason) = reason else { return TriggerDecision::None };

        if state.in_flight {
            state.suppressed += 1;
            tracing::debug!(
                target: "governor::feedback",
                task_id = %obs.task_id,
                %reason,
                "trigger suppressed: cycle in flight"
            );
            return TriggerDecision::None;
        }

        state.in_flight = true;
        state.since_cycle = 0;
        state.anchor_ms = Some(obs.timestamp_ms);
        tracing::info!(target: "governor::feedback", task_id = %obs.task_id, %reason, "improvement cycle triggered");
        TriggerDecision::Improve(CycleTicket {
            task_id: obs.task_id.clone(),
            reason,
            issued_at_ms: obs.timestamp_ms,
        })
    }

    fn check(&self, state: &TaskFeedback, elapsed_ms: u64) -> Option<TriggerReason> {
        if state.errors.is_full() {
            if let Some(rolling) = state.errors.mean() {
                if rolling > self.config.degradation_threshold {
                    return Some(TriggerReason::Degradation {
                        rolling_error: rolling,
                        threshold: self.config.degradation_threshold,
                    });
                }
            }
        }
        if let Some(budget) = self.config.count_budget {
            if state.since_cycle >= budget {
                return Some(TriggerReason::CountBudget { observations: state.since_cycle });
            }
        }
        if let Some(budget) = self.config.time_budget_ms {
            if elapsed_ms >= budget {
                return Some(TriggerReason::TimeBudget { elapsed_ms });
            }
        }
        None
    }

    /// Operator-initiated trigger, subject to the same one-in-flight rule.
    pub fn request(&self, task_id: &str, now_ms: u64) -> Result<CycleTicket> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| GovernorError::Persistence("feedback lock poisoned".into()))?;
        let state = tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskFeedback::new(self.config.window_size));
        if state.in_flight {
            state.suppressed += 1;
            return Err(GovernorError::CycleInFlight(task_id.to_string()));
        }
        state.in_flight = true;
        state.since_cycle = 0;
        Ok(CycleTicket { task_id: task_id.to_string(), reason: TriggerReason::Manual, issued_at_ms: now_ms })
    }

    /// Mark the task's cycle finished.  The error window and both budgets
    /// restart, so the next decision is made on post-cycle observations only.
    pub fn resolve(&self, task_id: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(state) = tasks.get_mut(task_id) {
                state.in_flight = false;
                state.errors.clear();
                state.since_cycle = 0;
                state.anchor_ms = None;
            }
        }
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .map(|t| t.get(task_id).is_some_and(|s| s.in_flight))
            .unwrap_or(false)
    }

    /// Number of tasks with a cycle in flight.
    pub fn in_flight_count(&self) -> usize {
        self.tasks
            .lock()
            .map(|t| t.values().filter(|s| s.in_flight).count())
            .unwrap_or(0)
    }

    pub fn suppressed_count(&self, task_id: &str) -> u64 {
        self.tasks
            .lock()
            .map(|t| t.get(task_id).map(|s| s.suppressed).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Rolling error over the current window, if any observations are held.
    pub fn rolling_error(&self, task_id: &str) -> Option<f64> {
        self.tasks.lock().ok()?.get(task_id)?.errors.mean()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
