//! # Stage: Version Manager
//!
//! ## Responsibility
//! Git-like history of every configuration a task's model has run with.
//! Owns the active pointer: `commit` moves it to a new child version,
//! `revert` moves it back to an ancestor.  Versions are never deleted;
//! superseded and reverted versions stay for audit.
//!
//! ## Guarantees
//! - Exactly one `Active` version per task after every operation
//! - Mutually exclusive: one global lock covers every commit and revert, so
//!   a modification's `parent_version_id` is checked and replaced atomically
//! - All-or-nothing: the model is changed first, then the store in one
//!   transaction, then memory; a failure at any step undoes the earlier ones
//! - Shadow-backed: `metrics_at_commit` can only be built from a `ShadowVerdict`
//!
//! ## NOT Responsible For
//! - Deciding whether to commit (that is the control loop)
//! - Storage mechanics (that is the [`VersionStore`])

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};
use crate::model::{ApplyHandle, ModelConfig, TrainableModel};
use crate::self_modify::store::VersionStore;
use crate::self_modify::transform::{Modification, ModificationKind};
use crate::self_tune::shadow::ShadowVerdict;

// ---------------------------------------------------------------------------
// Version types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Active,
    Superseded,
    Reverted,
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionState::Active => write!(f, "active"),
            VersionState::Superseded => write!(f, "superseded"),
            VersionState::Reverted => write!(f, "reverted"),
        }
    }
}

/// Shadow-measured metrics recorded when a version is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMetrics {
    pub delta_metric: f64,
    pub candidate_score: f64,
    pub active_score: f64,
    pub sample_count: usize,
    pub p_value: f64,
}

impl From<&ShadowVerdict> for CommitMetrics {
    fn from(v: &ShadowVerdict) -> Self {
        Self {
            delta_metric: v.delta_metric,
            candidate_score: v.candidate_score,
            active_score: v.active_score,
            sample_count: v.sample_count,
            p_value: v.p_value,
        }
    }
}

/// One node of a task's configuration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Strictly increasing across all tasks.
    pub id: u64,
    pub task_id: String,
    /// `None` only for the root.
    pub parent_id: Option<u64>,
    pub modification_id: Option<u64>,
    pub modification: Option<Modification>,
    pub state: VersionState,
    pub applied_at_ms: u64,
    pub metrics_at_commit: Option<CommitMetrics>,
    /// Full configuration this version runs with.
    pub config: ModelConfig,
}

impl Version {
    pub fn root(id: u64, task_id: &str, config: ModelConfig, applied_at_ms: u64) -> Self {
        Self {
            id,
            task_id: task_id.to_string(),
            parent_id: None,
            modification_id: None,
            modification: None,
            state: VersionState::Active,
            applied_at_ms,
            metrics_at_commit: None,
            config,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == VersionState::Active
    }

    pub fn kind(&self) -> Option<ModificationKind> {
        self.modification.as_ref().map(|m| m.kind)
    }
}

// ---------------------------------------------------------------------------
// ConfigDiff
// ---------------------------------------------------------------------------

/// One changed entry between two versions; `None` means absent on that side.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDiff<T> {
    pub name: String,
    pub before: Option<T>,
    pub after: Option<T>,
}

/// Difference between two retained versions of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDiff {
    pub from_id: u64,
    pub to_id: u64,
    pub params: Vec<EntryDiff<f64>>,
    pub options: Vec<EntryDiff<String>>,
    /// `Some((before, after))` when the layer layout changed.
    pub layers: Option<(Vec<u32>, Vec<u32>)>,
}

impl ConfigDiff {
    pub fn between(from: &Version, to: &Version) -> Self {
        fn entries<T: Clone + PartialEq>(a: &BTreeMap<String, T>, b: &BTreeMap<String, T>) -> Vec<EntryDiff<T>> {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            keys.into_iter()
                .filter_map(|k| {
                    let before = a.get(k).cloned();
                    let after = b.get(k).cloned();
                    (before != after).then(|| EntryDiff { name: k.clone(), before, after })
                })
                .collect()
        }
        Self {
            from_id: from.id,
            to_id: to.id,
            params: entries(&from.config.params, &to.config.params),
            options: entries(&from.config.options, &to.config.options),
            layers: (from.config.layers != to.config.layers)
                .then(|| (from.config.layers.clone(), to.config.layers.clone())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.options.is_empty() && self.layers.is_none()
    }
}

// ---------------------------------------------------------------------------
// VersionManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TaskHistory {
    versions: BTreeMap<u64, Version>,
    active: u64,
    /// Live handles for versions applied in this process.
    handles: HashMap<u64, ApplyHandle>,
}

impl TaskHistory {
    fn active(&self) -> Result<&Version> {
        self.versions
            .get(&self.active)
            .ok_or_else(|| GovernorError::Persistence(format!("active v{} missing", self.active)))
    }
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, TaskHistory>,
    next_id: u64,
}

/// Owner of every task's active pointer.
pub struct VersionManager {
    inner: Mutex<Inner>,
    model: Arc<dyn TrainableModel>,
    store: Arc<dyn VersionStore>,
}

impl fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionManager").finish_non_exhaustive()
    }
}

impl VersionManager {
    /// Rebuild from `store`.  For each task the persisted `Active` version
    /// becomes the active pointer.
    pub fn open(model: Arc<dyn TrainableModel>, store: Arc<dyn VersionStore>) -> Result<Self> {
        let mut inner = Inner { tasks: HashMap::new(), next_id: 0 };
        for v in store.load_versions()? {
            inner.next_id = inner.next_id.max(v.id + 1);
            let h = inner.tasks.entry(v.task_id.clone()).or_default();
            if v.is_active() {
                if h.versions.get(&h.active).is_some_and(Version::is_active) {
                    return Err(GovernorError::Persistence(format!(
                        "task {} has two active versions (v{} and v{})",
                        v.task_id, h.active, v.id
                    )));
                }
                h.active = v.id;
            }
            h.versions.insert(v.id, v);
        }
        for (task, h) in &inner.tasks {
            h.active()?;
            tracing::info!(target: "governor::version", task_id = %task, active = h.active, versions = h.versions.len(), "history restored");
        }
        Ok(Self { inner: Mutex::new(inner), model, store })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| GovernorError::Persistence("version lock poisoned".into()))
    }

    /// Create the root version for a new task, or return the restored active one.
    pub fn init_task(&self, task_id: &str, config: ModelConfig, now_ms: u64) -> Result<Version> {
        let mut inner = self.lock()?;
        if let Some(h) = inner.tasks.get(task_id) {
            return h.active().cloned();
        }
        let root = Version::root(inner.next_id, task_id, config, now_ms);
        self.store.commit_versions(std::slice::from_ref(&root))?;
        inner.next_id += 1;
        let mut h = TaskHistory { active: root.id, ..Default::default() };
        h.versions.insert(root.id, root.clone());
        inner.tasks.insert(task_id.to_string(), h);
        tracing::info!(target: "governor::version", task_id, version = root.id, "root version created");
        Ok(root)
    }

    pub fn active(&self, task_id: &str) -> Result<Version> {
        let inner = self.lock()?;
        inner
            .tasks
            .get(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?
            .active()
            .cloned()
    }

    /// Every retained version of `task_id`, oldest first.
    pub fn history(&self, task_id: &str) -> Result<Vec<Version>> {
        let inner = self.lock()?;
        let h = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?;
        Ok(h.versions.values().cloned().collect())
    }

    pub fn tasks(&self) -> Vec<String> {
        let mut t: Vec<String> = self.lock().map(|i| i.tasks.keys().cloned().collect()).unwrap_or_default();
        t.sort();
        t
    }

    /// Highest modification id in any retained version.
    pub fn max_modification_id(&self) -> u64 {
        self.lock()
            .map(|i| {
                i.tasks
                    .values()
                    .flat_map(|h| h.versions.values())
                    .filter_map(|v| v.modification_id)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Apply `modification` on top of the active version.
    ///
    /// Fails with `StaleParent` if the active version moved since the
    /// modification was generated.
    pub fn commit(&self, modification: &Modification, verdict: &ShadowVerdict, now_ms: u64) -> Result<Version> {
        let task_id = modification.task_id.as_str();
        let mut inner = self.lock()?;
        let next_id = inner.next_id;
        let h = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?;

        if modification.parent_version_id != h.active {
            tracing::warn!(
                target: "governor::version",
                task_id,
                expected = modification.parent_version_id,
                actual = h.active,
                "stale parent"
            );
            return Err(GovernorError::StaleParent { expected: modification.parent_version_id, actual: h.active });
        }

        let parent = h.active()?.clone();
        let config = modification.apply_to(&parent.config)?;
        let handle = self.model.apply(task_id, modification, &config)?;

        let new = Version {
            id: next_id,
            task_id: task_id.to_string(),
            parent_id: Some(parent.id),
            modification_id: Some(modification.id),
            modification: Some(modification.clone()),
            state: VersionState::Active,
            applied_at_ms: now_ms,
            metrics_at_commit: Some(CommitMetrics::from(verdict)),
            config,
        };
        let superseded = Version { state: VersionState::Superseded, ..parent };

        if let Err(e) = self.store.commit_versions(&[superseded.clone(), new.clone()]) {
            if let Err(rb) = self.model.rollback(task_id, handle) {
                tracing::error!(target: "governor::version", task_id, error = %rb, "rollback after failed persist also failed");
            }
            return Err(e);
        }

        h.versions.insert(superseded.id, superseded);
        h.versions.insert(new.id, new.clone());
        h.active = new.id;
        h.handles.insert(new.id, handle);
        inner.next_id += 1;

        tracing::info!(
            target: "governor::version",
            task_id,
            from = new.parent_id.unwrap_or_default(),
            to = new.id,
            modification_id = modification.id,
            "version committed"
        );
        Ok(new)
    }

    /// Move the active pointer back to `target`, an ancestor of the active version.
    ///
    /// Reverting to the version that is already active is a no-op.
    pub fn revert(&self, task_id: &str, target: u64, now_ms: u64) -> Result<Version> {
        let mut inner = self.lock()?;
        let h = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?;
        if !h.versions.contains_key(&target) {
            return Err(GovernorError::UnknownVersion(target));
        }
        if target == h.active {
            return h.active().cloned();
        }

        // Lineage from active back to (not including) target, newest first.
        let mut path = Vec::new();
        let mut cursor = h.active()?;
        loop {
            let Some(parent_id) = cursor.parent_id else {
                return Err(GovernorError::NotAnAncestor { target, active: h.active });
            };
            path.push(cursor.id);
            if parent_id == target {
                break;
            }
            cursor = h
                .versions
                .get(&parent_id)
                .ok_or_else(|| GovernorError::Persistence(format!("v{parent_id} missing from lineage")))?;
        }

        // Undo on the model, newest first; redo on failure.
        let mut undone: Vec<u64> = Vec::new();
        for &vid in &path {
            if let Err(e) = self.undo_on_model(task_id, h, vid) {
                self.redo_on_model(task_id, h, &undone);
                return Err(e);
            }
            undone.push(vid);
        }

        let mut updated: Vec<Version> = path
            .iter()
            .filter_map(|vid| h.versions.get(vid))
            .map(|v| Version { state: VersionState::Reverted, ..v.clone() })
            .collect();
        let mut restored = h
            .versions
            .get(&target)
            .cloned()
            .ok_or(GovernorError::UnknownVersion(target))?;
        restored.state = VersionState::Active;
        updated.push(restored.clone());

        if let Err(e) = self.store.commit_versions(&updated) {
            self.redo_on_model(task_id, h, &undone);
            return Err(e);
        }

        for v in updated {
            h.handles.remove(&v.id);
            h.versions.insert(v.id, v);
        }
        h.active = target;
        tracing::info!(
            target: "governor::version",
            task_id,
            to = target,
            reverted = ?path,
            at_ms = now_ms,
            "version reverted"
        );
        Ok(restored)
    }

    /// Undo version `vid` on the live model: roll back its handle, or apply
    /// the inverse when the handle predates a restart.
    fn undo_on_model(&self, task_id: &str, h: &mut TaskHistory, vid: u64) -> Result<()> {
        if let Some(handle) = h.handles.remove(&vid) {
            return match self.model.rollback(task_id, handle.clone()) {
                Ok(()) => Ok(()),
                Err(e) => {
                    h.handles.insert(vid, handle);
                    Err(e)
                }
            };
        }
        let v = h.versions.get(&vid).ok_or(GovernorError::UnknownVersion(vid))?;
        let (Some(m), Some(parent)) = (v.modification.as_ref(), v.parent_id.and_then(|p| h.versions.get(&p)))
        else {
            return Err(GovernorError::Persistence(format!("v{vid} has no modification to undo")));
        };
        let inverse = Modification {
            payload: m
                .inverse_payload()
                .ok_or_else(|| GovernorError::InvalidTransformation(format!("modification {} has no inverse", m.id)))?,
            parent_version_id: vid,
            ..m.clone()
        };
        let handle = self.model.apply(task_id, &inverse, &parent.config)?;
        self.model.release(task_id, handle);
        Ok(())
    }

    /// Best-effort re-application after a failed revert, oldest first.
    fn redo_on_model(&self, task_id: &str, h: &mut TaskHistory, undone: &[u64]) {
        for &vid in undone.iter().rev() {
            let Some(v) = h.versions.get(&vid) else { continue };
            let Some(m) = v.modification.clone() else { continue };
            match self.model.apply(task_id, &m, &v.config) {
                Ok(handle) => {
                    h.handles.insert(vid, handle);
                }
                Err(e) => {
                    tracing::error!(target: "governor::version", task_id, version = vid, error = %e, "redo after failed revert failed");
                }
            }
        }
    }

    /// Configuration difference between two retained versions of one task.
    pub fn diff(&self, task_id: &str, from: u64, to: u64) -> Result<ConfigDiff> {
        let inner = self.lock()?;
        let h = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))?;
        let a = h.versions.get(&from).ok_or(GovernorError::UnknownVersion(from))?;
        let b = h.versions.get(&to).ok_or(GovernorError::UnknownVersion(to))?;
        Ok(ConfigDiff::between(a, b))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
