//! # Model Capability
//!
//! ## Responsibility
//! The narrow surface through which the governor touches a trainable model:
//! `predict`, `apply` and `rollback`.  Also defines [`ModelConfig`], the plain
//! data that every [`Transformation`](crate::self_modify::transform::Transformation)
//! operates on.
//!
//! ## Guarantees
//! - Object safe: the loop holds an `Arc<dyn TrainableModel>`
//! - `predict` takes the configuration explicitly, so a candidate can be
//!   evaluated without being applied to the live model
//!
//! ## NOT Responsible For
//! - Training algorithms or architectures (opaque to the governor)
//! - Deciding which configuration is live (that is the version manager)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};
use crate::self_modify::transform::Modification;

// ---------------------------------------------------------------------------
// Task kind
// ---------------------------------------------------------------------------

/// The learning problem a task solves; decides how error and score are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Discrete labels; error is 0/1 mismatch, score is accuracy.
    #[default]
    Classification,
    /// Continuous targets; error is absolute error, score is negated mean error.
    Regression,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Classification => write!(f, "classification"),
            TaskKind::Regression => write!(f, "regression"),
        }
    }
}

impl TaskKind {
    /// Derived error for one prediction.
    pub fn error(&self, predicted: f64, actual: f64) -> f64 {
        match self {
            TaskKind::Classification => {
                if (predicted - actual).abs() < 0.5 { 0.0 } else { 1.0 }
            }
            TaskKind::Regression => (predicted - actual).abs(),
        }
    }

    /// Per-sample score, higher is better.  Used for paired shadow comparison.
    pub fn sample_score(&self, predicted: f64, actual: f64) -> f64 {
        match self {
            TaskKind::Classification => 1.0 - self.error(predicted, actual),
            TaskKind::Regression => -self.error(predicted, actual),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelConfig
// ---------------------------------------------------------------------------

/// Everything a modification can change about a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    /// Numeric hyperparameters (learning rate, dropout, ...).
    pub params: BTreeMap<String, f64>,
    /// Units per hidden layer, input side first.
    pub layers: Vec<u32>,
    /// Categorical switches (optimizer, activation, ...).
    pub options: BTreeMap<String, String>,
}

impl ModelConfig {
    pub fn with_param(mut self, name: &str, value: f64) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn with_layers(mut self, layers: &[u32]) -> Self {
        self.layers = layers.to_vec();
        self
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Sum of units across all layers.
    pub fn total_units(&self) -> u64 {
        self.layers.iter().map(|&u| u64::from(u)).sum()
    }

    /// Look up a numeric value, including the structural pseudo-parameters
    /// `arch.layers` and `arch.units.total`.
    pub fn numeric(&self, name: &str) -> Option<f64> {
        match name {
            "arch.layers" => Some(self.layers.len() as f64),
            "arch.units.total" => Some(self.total_units() as f64),
            other => self.params.get(other).copied(),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Opaque token returned by [`TrainableModel::apply`]; passing it back to
/// [`TrainableModel::rollback`] undoes exactly that application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyHandle {
    pub id: u64,
    pub task_id: String,
    pub modification_id: u64,
}

/// The capability surface the governor needs from a model.
pub trait TrainableModel: Send + Sync {
    /// Produce an output for `input` under `config`.
    fn predict(&self, task_id: &str, config: &ModelConfig, input: &[f64]) -> Result<f64>;

    /// Make `modification` live.  `resulting` is the configuration it produces.
    fn apply(
        &self,
        task_id: &str,
        modification: &Modification,
        resulting: &ModelConfig,
    ) -> Result<ApplyHandle>;

    /// Undo a previous [`apply`](TrainableModel::apply).
    fn rollback(&self, task_id: &str, handle: ApplyHandle) -> Result<()>;

    /// Forget `handle` without undoing it; the application stays live.
    fn release(&self, _task_id: &str, _handle: ApplyHandle) {}
}

// ---------------------------------------------------------------------------
// SimulatedModel
// ---------------------------------------------------------------------------

/// Deterministic stand-in model used by the CLI simulation and tests.
///
/// Quality is a function of how close `learning_rate` sits to a per-task
/// optimum plus a small bonus for depth.  Inputs are `[label_or_target, u]`
/// where `u ∈ [0, 1)` is a per-sample uniform draw: a classification sample is
/// answered correctly iff `u < quality`, so two configurations evaluated on
/// the same inputs are naturally paired.
#[derive(Debug)]
pub struct SimulatedModel {
    optimum_lr: Mutex<HashMap<String, f64>>,
    kinds: Mutex<HashMap<String, TaskKind>>,
    live: Mutex<HashMap<String, ModelConfig>>,
    handles: Mutex<HashMap<u64, (String, ModelConfig)>>,
    next_handle: AtomicU64,
    fail_apply: AtomicBool,
}

impl Default for SimulatedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedModel {
    pub fn new() -> Self {
        Self {
            optimum_lr: Mutex::new(HashMap::new()),
            kinds: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            fail_apply: AtomicBool::new(false),
        }
    }

    /// Register a task with its kind, starting live config and optimal learning rate.
    pub fn add_task(&self, task_id: &str, kind: TaskKind, config: ModelConfig, optimum_lr: f64) {
        if let Ok(mut m) = self.kinds.lock() {
            m.insert(task_id.to_string(), kind);
        }
        if let Ok(mut m) = self.live.lock() {
            m.insert(task_id.to_string(), config);
        }
        self.set_optimum(task_id, optimum_lr);
    }

    /// Move the optimum, simulating input drift.
    pub fn set_optimum(&self, task_id: &str, lr: f64) {
        if let Ok(mut m) = self.optimum_lr.lock() {
            m.insert(task_id.to_string(), lr);
        }
    }

    /// Make the next `apply` calls fail.
    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// The configuration currently live for `task_id`.
    pub fn live_config(&self, task_id: &str) -> Option<ModelConfig> {
        self.live.lock().ok()?.get(task_id).cloned()
    }

    /// Number of applications not yet rolled back.
    pub fn outstanding_handles(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Quality in `[0.05, 0.99]` of `config` for `task_id`.
    pub fn quality(&self, task_id: &str, config: &ModelConfig) -> f64 {
        let optimum = self
            .optimum_lr
            .lock()
            .ok()
            .and_then(|m| m.get(task_id).copied())
            .unwrap_or(0.01);
        let lr = config.params.get("learning_rate").copied().unwrap_or(optimum);
        let miss = if lr > 0.0 && optimum > 0.0 { (lr / optimum).log2().abs() } else { 4.0 };
        let depth = (config.layers.len() as f64 - 2.0).clamp(0.0, 2.0) * 0.02;
        (0.92 - 0.15 * miss + depth).clamp(0.05, 0.99)
    }

    fn kind(&self, task_id: &str) -> TaskKind {
        self.kinds
            .lock()
            .ok()
            .and_then(|m| m.get(task_id).copied())
            .unwrap_or_default()
    }
}

impl TrainableModel for SimulatedModel {
    fn predict(&self, task_id: &str, config: &ModelConfig, input: &[f64]) -> Result<f64> {
        let (target, u) = match input {
            [t, u, ..] => (*t, *u),
            _ => return Err(GovernorError::Model("input must be [target, u]".into())),
        };
        let q = self.quality(task_id, config);
        Ok(match self.kind(task_id) {
            TaskKind::Classification => {
                if u < q { target } else { 1.0 - target }
            }
            TaskKind::Regression => target + (1.0 - q) * u,
        })
    }

    fn apply(
        &self,
        task_id: &str,
        modification: &Modification,
        resulting: &ModelConfig,
    ) -> Result<ApplyHandle> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(GovernorError::Model(format!(
                "apply of modification {} refused",
                modification.id
            )));
        }
        let mut live = self
            .live
            .lock()
            .map_err(|_| GovernorError::Model("live config lock poisoned".into()))?;
        let previous = live.insert(task_id.to_string(), resulting.clone()).unwrap_or_default();
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut h) = self.handles.lock() {
            h.insert(id, (task_id.to_string(), previous));
        }
        Ok(ApplyHandle { id, task_id: task_id.to_string(), modification_id: modification.id })
    }

    fn rollback(&self, task_id: &str, handle: ApplyHandle) -> Result<()> {
        let entry = self
            .handles
            .lock()
            .map_err(|_| GovernorError::Model("handle table lock poisoned".into()))?
            .remove(&handle.id);
        match entry {
            Some((owner, previous)) if owner == task_id => {
                if let Ok(mut live) = self.live.lock() {
                    live.insert(owner, previous);
                }
                Ok(())
            }
            Some((owner, _)) => Err(GovernorError::Model(format!(
                "handle {} belongs to task {owner}",
                handle.id
            ))),
            None => Err(GovernorError::Model(format!("unknown handle {}", handle.id))),
        }
    }

    fn release(&self, _task_id: &str, handle: ApplyHandle) {
        if let Ok(mut h) = self.handles.lock() {
            h.remove(&handle.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
