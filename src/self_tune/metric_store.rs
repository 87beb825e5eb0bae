//! # Stage: Metric Store
//!
//! ## Responsibility
//! Append-only record of per-prediction observations.  Computes rolling
//! [`MetricSnapshot`]s over a window on demand and keeps a bounded history of
//! captured snapshots for trend analysis.
//!
//! ## Guarantees
//! - Thread-safe: `record` may be called from any number of producers; writes
//!   for one task are linearized behind that task's lock, writes for different
//!   tasks never contend
//! - Ordered: each task's series is kept in timestamp order; late arrivals are
//!   inserted in place and flagged, never rejected
//! - Idempotent: `snapshot` is a pure read; identical data gives an identical
//!   snapshot
//! - Bounded: observations older than the retention horizon are pruned lazily
//!   on write, except those pinned by a cycle that has not been superseded
//!
//! ## NOT Responsible For
//! - Deciding when to act on a degradation (that is the feedback aggregator)
//! - Durable storage of raw observations

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};
use crate::model::TaskKind;

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One prediction and, once known, its ground truth.  Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Assigned by the store on `record`; zero before that.
    pub id: u64,
    pub timestamp_ms: u64,
    pub task_id: String,
    pub kind: TaskKind,
    pub predicted: f64,
    pub actual: Option<f64>,
    /// Derived from `predicted` and `actual`; `None` while the outcome is pending.
    pub error: Option<f64>,
}

impl Observation {
    pub fn new(task_id: &str, kind: TaskKind, timestamp_ms: u64, predicted: f64, actual: Option<f64>) -> Self {
        Self {
            id: 0,
            timestamp_ms,
            task_id: task_id.to_string(),
            kind,
            predicted,
            actual,
            error: actual.map(|a| kind.error(predicted, a)),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.error.is_some()
    }
}

/// Returned by [`MetricStore::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordReceipt {
    pub id: u64,
    /// The timestamp was older than the newest already recorded for this task.
    pub out_of_order: bool,
}

// ---------------------------------------------------------------------------
// Window + snapshot
// ---------------------------------------------------------------------------

/// The slice of a task's series a snapshot summarises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    /// The newest `n` resolved observations.
    LastN(usize),
    /// Resolved observations within `ms` of the newest timestamp.
    Span { ms: u64 },
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Window::LastN(n) => write!(f, "last {n}"),
            Window::Span { ms } => write!(f, "{ms}ms"),
        }
    }
}

/// Derived summary of a window of observations.  Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub task_id: String,
    pub window: Window,
    pub kind: TaskKind,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub mean_error: Option<f64>,
    /// Task-appropriate scalar, higher is better: accuracy or negated mean error.
    pub score: f64,
    pub sample_count: usize,
    /// Timestamp of the oldest observation included.
    pub window_start_ms: u64,
    /// Timestamp of the newest observation included.
    pub computed_at_ms: u64,
}

impl MetricSnapshot {
    fn from_observations(task_id: &str, kind: TaskKind, window: Window, obs: &[&Observation]) -> Self {
        let resolved: Vec<(f64, f64, f64)> = obs
            .iter()
            .filter_map(|o| Some((o.predicted, o.actual?, o.error?)))
            .collect();
        let n = resolved.len();
        let computed_at_ms = obs.iter().map(|o| o.timestamp_ms).max().unwrap_or(0);
        let window_start_ms = obs.iter().map(|o| o.timestamp_ms).min().unwrap_or(0);
        let mean_error = if n == 0 {
            None
        } else {
            Some(resolved.iter().map(|r| r.2).sum::<f64>() / n as f64)
        };

        let (accuracy, precision, recall, f1) = match kind {
            TaskKind::Classification if n > 0 => {
                let positive = |v: f64| v >= 0.5;
                let mut tp = 0usize;
                let mut fp = 0usize;
                let mut fn_ = 0usize;
                for &(p, a, _) in &resolved {
                    match (positive(p), positive(a)) {
                        (true, true) => tp += 1,
                        (true, false) => fp += 1,
                        (false, true) => fn_ += 1,
                        (false, false) => {}
                    }
                }
                let acc = mean_error.map(|e| 1.0 - e);
                let precision = if tp + fp > 0 { Some(tp as f64 / (tp + fp) as f64) } else { None };
                let recall = if tp + fn_ > 0 { Some(tp as f64 / (tp + fn_) as f64) } else { None };
                let f1 = match (precision, recall) {
                    (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
                    _ => None,
                };
                (acc, precision, recall, f1)
            }
            _ => (None, None, None, None),
        };

        let score = match kind {
            TaskKind::Classification => accuracy.unwrap_or(0.0),
            TaskKind::Regression => mean_error.map(|e| -e).unwrap_or(0.0),
        };

        Self {
            task_id: task_id.to_string(),
            window,
            kind,
            accuracy,
            precision,
            recall,
            f1,
            mean_error,
            score,
            sample_count: n,
            window_start_ms,
            computed_at_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Retention settings for the metric store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Observations older than this (relative to the newest) are pruned on write.
    pub retention_horizon_ms: u64,
    /// Captured snapshots kept per task.
    pub snapshot_retention: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_horizon_ms: 24 * 60 * 60 * 1_000,
            snapshot_retention: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-task series
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TaskSeries {
    kind: TaskKind,
    /// Sorted by `timestamp_ms`, ties in arrival order.
    observations: Vec<Observation>,
    /// Outcomes that arrived after their prediction, keyed by observation id.
    outcomes: HashMap<u64, f64>,
    /// cycle_id → earliest timestamp that cycle still needs.
    pins: HashMap<u64, u64>,
    history: VecDeque<MetricSnapshot>,
    out_of_order: u64,
}

impl TaskSeries {
    fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            observations: Vec::new(),
            outcomes: HashMap::new(),
            pins: HashMap::new(),
            history: VecDeque::new(),
            out_of_order: 0,
        }
    }

    fn newest_ts(&self) -> Option<u64> {
        self.observations.last().map(|o| o.timestamp_ms)
    }

    /// Observation with late outcomes joined in.
    fn resolved_view(&self, o: &Observation) -> Observation {
        match (o.actual, self.outcomes.get(&o.id)) {
            (None, Some(&actual)) => Observation {
                actual: Some(actual),
                error: Some(o.kind.error(o.predicted, actual)),
                ..o.clone()
            },
            _ => o.clone(),
        }
    }

    fn prune(&mut self, horizon_ms: u64) -> usize {
        let Some(newest) = self.newest_ts() else { return 0 };
        let mut cutoff = newest.saturating_sub(horizon_ms);
        if let Some(&pinned) = self.pins.values().min() {
            cutoff = cutoff.min(pinned);
        }
        let keep_from = self.observations.partition_point(|o| o.timestamp_ms < cutoff);
        if keep_from == 0 {
            return 0;
        }
        for o in self.observations.drain(..keep_from) {
            self.outcomes.remove(&o.id);
        }
        keep_from
    }

    fn window(&self, window: Window) -> Vec<Observation> {
        let resolved = self
            .observations
            .iter()
            .map(|o| self.resolved_view(o))
            .filter(Observation::is_resolved);
        match window {
            Window::LastN(n) => {
                let all: Vec<Observation> = resolved.collect();
                let skip = all.len().saturating_sub(n);
                all.into_iter().skip(skip).collect()
            }
            Window::Span { ms } => {
                let from = self.newest_ts().unwrap_or(0).saturating_sub(ms);
                resolved.filter(|o| o.timestamp_ms >= from).collect()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MetricStore
// ---------------------------------------------------------------------------

/// Concurrent per-task observation store.
#[derive(Debug)]
pub struct MetricStore {
    config: MetricsConfig,
    series: RwLock<HashMap<String, Arc<Mutex<TaskSeries>>>>,
    next_id: AtomicU64,
}

impl MetricStore {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            series: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Declare a task before its first observation arrives.
    pub fn register(&self, task_id: &str, kind: TaskKind) {
        if let Ok(mut map) = self.series.write() {
            map.entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TaskSeries::new(kind))));
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.series.read().map(|m| m.contains_key(task_id)).unwrap_or(false)
    }

    fn series_for(&self, task_id: &str) -> Option<Arc<Mutex<TaskSeries>>> {
        self.series.read().ok()?.get(task_id).cloned()
    }

    fn series_or_insert(&self, task_id: &str, kind: TaskKind) -> Result<Arc<Mutex<TaskSeries>>> {
        if let Some(s) = self.series_for(task_id) {
            return Ok(s);
        }
        let mut map = self.series.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(
            map.entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TaskSeries::new(kind)))),
        ))
    }

    /// Record an observation.  Assigns its id and returns whether it arrived out of order.
    pub fn record(&self, mut obs: Observation) -> Result<RecordReceipt> {
        let series = self.series_or_insert(&obs.task_id, obs.kind)?;
        let mut s = series.lock().map_err(|_| poisoned())?;

        obs.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let out_of_order = s.newest_ts().is_some_and(|newest| obs.timestamp_ms < newest);
        if out_of_order {
            s.out_of_order += 1;
            tracing::warn!(
                target: "governor::metric_store",
                task_id = %obs.task_id,
                timestamp_ms = obs.timestamp_ms,
                "out-of-order observation"
            );
        }
        let at = s.observations.partition_point(|o| o.timestamp_ms <= obs.timestamp_ms);
        let receipt = RecordReceipt { id: obs.id, out_of_order };
        s.observations.insert(at, obs);

        let pruned = s.prune(self.config.retention_horizon_ms);
        if pruned > 0 {
            tracing::debug!(target: "governor::metric_store", pruned, "pruned observations past horizon");
        }
        Ok(receipt)
    }

    /// Attach ground truth that arrived after the prediction.  Returns the
    /// resolved view of the observation.
    pub fn record_outcome(&self, task_id: &str, observation_id: u64, actual: f64) -> Result<Observation> {
        let series = self
            .series_for(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?;
        let mut s = series.lock().map_err(|_| poisoned())?;
        let obs = s
            .observations
            .iter()
            .find(|o| o.id == observation_id)
            .cloned()
            .ok_or_else(|| GovernorError::UnknownObservation { task_id: task_id.to_string(), id: observation_id })?;
        if obs.actual.is_some() || s.outcomes.contains_key(&observation_id) {
            return Err(GovernorError::AlreadyResolved(observation_id));
        }
        s.outcomes.insert(observation_id, actual);
        Ok(s.resolved_view(&obs))
    }

    /// Compute a snapshot.  Pure: does not touch the captured history.
    pub fn snapshot(&self, task_id: &str, window: Window) -> Result<MetricSnapshot> {
        let series = self
            .series_for(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?;
        let s = series.lock().map_err(|_| poisoned())?;
        let obs = s.window(window);
        let refs: Vec<&Observation> = obs.iter().collect();
        Ok(MetricSnapshot::from_observations(task_id, s.kind, window, &refs))
    }

    /// Compute a snapshot and append it to the task's bounded history.
    pub fn capture(&self, task_id: &str, window: Window) -> Result<MetricSnapshot> {
        let snap = self.snapshot(task_id, window)?;
        let series = self
            .series_for(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?;
        let mut s = series.lock().map_err(|_| poisoned())?;
        if s.history.len() >= self.config.snapshot_retention.max(1) {
            s.history.pop_front();
        }
        s.history.push_back(snap.clone());
        Ok(snap)
    }

    /// Captured snapshots, oldest first.
    pub fn history(&self, task_id: &str) -> Vec<MetricSnapshot> {
        self.series_for(task_id)
            .and_then(|s| s.lock().ok().map(|s| s.history.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Keep observations from `from_ts` onward until `unpin(cycle_id)`.
    pub fn pin(&self, task_id: &str, cycle_id: u64, from_ts: u64) {
        if let Some(series) = self.series_for(task_id) {
            if let Ok(mut s) = series.lock() {
                s.pins.insert(cycle_id, from_ts);
            }
        }
    }

    pub fn unpin(&self, task_id: &str, cycle_id: u64) {
        if let Some(series) = self.series_for(task_id) {
            if let Ok(mut s) = series.lock() {
                s.pins.remove(&cycle_id);
            }
        }
    }

    /// Number of retained observations for `task_id`.
    pub fn len(&self, task_id: &str) -> usize {
        self.series_for(task_id)
            .and_then(|s| s.lock().ok().map(|s| s.observations.len()))
            .unwrap_or(0)
    }

    /// Count of out-of-order arrivals for `task_id`.
    pub fn out_of_order_count(&self, task_id: &str) -> u64 {
        self.series_for(task_id)
            .and_then(|s| s.lock().ok().map(|s| s.out_of_order))
            .unwrap_or(0)
    }

    /// Newest observation timestamp for `task_id`.
    pub fn newest_timestamp(&self, task_id: &str) -> Option<u64> {
        self.series_for(task_id)?.lock().ok()?.newest_ts()
    }
}

fn poisoned() -> GovernorError {
    GovernorError::Persistence("metric store lock poisoned".into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
