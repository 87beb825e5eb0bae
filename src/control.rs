//! # Stage: Control Loop
//!
//! ## Responsibility
//! Closes the feedback cycle.  Observations flow in, the feedback aggregator
//! decides when a task needs attention, and each triggered cycle walks
//!
//! ```text
//! Idle ──► Triggered ──► Generating ──► Validating ──► ShadowTesting ──► Committing ──► Idle
//!              │              │  ▲            │               │               │
//!              │              │  └────────────┼─ stale parent ┼───────────────┘
//!              └──────────────┴───────────────┴───────────────┴──► Discarding ──► Idle
//! ```
//!
//! ## Guarantees
//! - Audited: every cycle ends with exactly one [`CycleRecord`], appended to
//!   the in-memory history and the version store, whether it committed, was
//!   rejected, or faulted
//! - One cycle per task: tickets come only from the feedback aggregator, which
//!   refuses a second ticket until `resolve`
//! - Gated: nothing reaches the version manager without a `Pass` verdict and
//!   an improved shadow verdict
//! - Cancellable: `stop` cancels in-flight shadow tests; those cycles are
//!   discarded with no version mutation
//!
//! ## NOT Responsible For
//! - How observations are produced (callers push them)
//! - Durable storage mechanics (the version store)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::GovernorConfig;
use crate::error::{GovernorError, Result};
use crate::model::{ModelConfig, TaskKind, TrainableModel};
use crate::now_ms;
use crate::self_modify::generator::ModificationGenerator;
use crate::self_modify::safety::{ConstraintSet, SafetyValidator, Verdict};
use crate::self_modify::store::VersionStore;
use crate::self_tune::feedback::{CycleTicket, FeedbackAggregator, TriggerDecision, TriggerReason};
use crate::self_tune::metric_store::{MetricSnapshot, MetricStore, Observation, Window};
use crate::self_tune::shadow::{ShadowOutcome, ShadowTester, TrafficSource};
use crate::self_tune::strategy::{LadderState, Strategy, StrategySelector};
use crate::self_tune::version::{ConfigDiff, Version, VersionManager, VersionState};

// ---------------------------------------------------------------------------
// Cycle types
// ---------------------------------------------------------------------------

/// Where a task's current cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Triggered,
    Generating,
    Validating,
    ShadowTesting,
    Committing,
    Discarding,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleState::Idle => "idle",
            CycleState::Triggered => "triggered",
            CycleState::Generating => "generating",
            CycleState::Validating => "validating",
            CycleState::ShadowTesting => "shadow_testing",
            CycleState::Committing => "committing",
            CycleState::Discarding => "discarding",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Committed,
    Rejected,
    Error,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Committed => write!(f, "committed"),
            CycleOutcome::Rejected => write!(f, "rejected"),
            CycleOutcome::Error => write!(f, "error"),
        }
    }
}

/// Audit entry for one cycle.  Never updated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: u64,
    pub task_id: String,
    pub trigger_reason: TriggerReason,
    pub strategy: Option<Strategy>,
    /// States visited after `Idle`, in order.
    pub path: Vec<CycleState>,
    /// Last candidate considered (a stale-parent restart replaces it).
    pub candidate_modification_id: Option<u64>,
    pub validator_verdict: Option<Verdict>,
    pub shadow_verdict: Option<ShadowOutcome>,
    pub final_outcome: CycleOutcome,
    pub committed_version_id: Option<u64>,
    /// Rejection reason or fault message.
    pub detail: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl CycleRecord {
    fn open(cycle_id: u64, ticket: &CycleTicket, started_at_ms: u64) -> Self {
        Self {
            cycle_id,
            task_id: ticket.task_id.clone(),
            trigger_reason: ticket.reason.clone(),
            strategy: None,
            path: Vec::new(),
            candidate_modification_id: None,
            validator_verdict: None,
            shadow_verdict: None,
            final_outcome: CycleOutcome::Rejected,
            committed_version_id: None,
            detail: None,
            started_at_ms,
            finished_at_ms: started_at_ms,
        }
    }

    fn reject(&mut self, detail: impl Into<String>) {
        self.final_outcome = CycleOutcome::Rejected;
        self.detail = Some(detail.into());
    }
}

/// Operator feedback attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNote {
    pub task_id: String,
    pub note: String,
    pub success: bool,
    pub at_ms: u64,
}

/// Per-task modification report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub task_id: String,
    pub active_version: u64,
    /// Versions in the retained history that were produced by a modification.
    pub modifications_committed: usize,
    pub cycles: usize,
    pub committed: usize,
    pub rejected: usize,
    pub errored: usize,
    /// `committed / cycles`, or 0 with no cycles.
    pub success_rate: f64,
    /// Committed modifications by kind.
    pub by_kind: BTreeMap<String, usize>,
    pub ladder: LadderState,
    pub operator_notes: usize,
    pub operator_successes: usize,
}

/// Closes out a cycle that never reached `finish`.
struct CycleGuard<'a> {
    owner: &'a ControlLoop,
    record: CycleRecord,
    finished: bool,
}

impl CycleGuard<'_> {
    fn fail(&mut self, detail: String) {
        if self.record.path.last() != Some(&CycleState::Discarding) {
            self.owner.enter(&mut self.record, CycleState::Discarding);
        }
        self.record.final_outcome = CycleOutcome::Error;
        self.record.detail = Some(detail);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::error!(
            target: "governor::control",
            task_id = %self.record.task_id,
            cycle = self.record.cycle_id,
            "cycle aborted before completion"
        );
        self.fail("cycle aborted before completion".into());
        self.owner.finish(self.record.clone());
    }
}

// ---------------------------------------------------------------------------
// ControlLoop
// ---------------------------------------------------------------------------

/// Owns every stage and drives cycles through them.
pub struct ControlLoop {
    config: GovernorConfig,
    metrics: MetricStore,
    feedback: FeedbackAggregator,
    selector: StrategySelector,
    generator: ModificationGenerator,
    validator: SafetyValidator,
    shadow: ShadowTester,
    versions: VersionManager,
    store: Arc<dyn VersionStore>,
    constraints: RwLock<Arc<ConstraintSet>>,
    kinds: RwLock<HashMap<String, TaskKind>>,
    states: Mutex<HashMap<String, CycleState>>,
    cycles: Mutex<HashMap<String, Vec<CycleRecord>>>,
    notes: Mutex<HashMap<String, Vec<OperatorNote>>>,
    /// Resolved observations per task since the last periodic capture.
    since_capture: Mutex<HashMap<String, u64>>,
    /// Cycle whose trigger window is pinned in the metric store, per task.
    pinned: Mutex<HashMap<String, u64>>,
    next_cycle_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
}

impl fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLoop").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ControlLoop {
    /// Assemble the loop and restore persisted versions and cycle records.
    pub fn new(
        config: GovernorConfig,
        constraints: ConstraintSet,
        model: Arc<dyn TrainableModel>,
        traffic: Arc<dyn TrafficSource>,
        store: Arc<dyn VersionStore>,
    ) -> Result<Self> {
        config.validate()?;
        let versions = VersionManager::open(Arc::clone(&model), Arc::clone(&store))?;
        let generator = ModificationGenerator::new(config.generator.clone());

        let mut cycles = HashMap::new();
        let mut last_cycle = 0;
        let mut last_modification = versions.max_modification_id();
        for task in versions.tasks() {
            let records = store.load_cycles(&task)?;
            last_cycle = records.iter().map(|r| r.cycle_id).fold(last_cycle, u64::max);
            last_modification = records
                .iter()
                .filter_map(|r| r.candidate_modification_id)
                .fold(last_modification, u64::max);
            cycles.insert(task, records);
        }
        generator.resume_ids(last_modification);

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            metrics: MetricStore::new(config.metrics.clone()),
            feedback: FeedbackAggregator::new(config.feedback.clone()),
            selector: StrategySelector::new(config.strategy.clone()),
            generator,
            validator: SafetyValidator,
            shadow: ShadowTester::new(config.shadow.clone(), model, traffic),
            versions,
            store,
            constraints: RwLock::new(Arc::new(constraints)),
            kinds: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            cycles: Mutex::new(cycles),
            notes: Mutex::new(HashMap::new()),
            since_capture: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
            next_cycle_id: AtomicU64::new(last_cycle + 1),
            stop_tx,
            config,
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Make a task known.  Creates its root version unless one was restored.
    pub fn register_task(&self, task_id: &str, kind: TaskKind, initial: ModelConfig) -> Result<Version> {
        let active = self.versions.init_task(task_id, initial, now_ms())?;
        self.metrics.register(task_id, kind);
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.insert(task_id.to_string(), kind);
        }
        if let Ok(mut cycles) = self.cycles.lock() {
            cycles.entry(task_id.to_string()).or_default();
        }
        tracing::info!(target: "governor::control", task_id, version = active.id, "task registered");
        Ok(active)
    }

    fn kind_of(&self, task_id: &str) -> Result<TaskKind> {
        self.kinds
            .read()
            .ok()
            .and_then(|k| k.get(task_id).copied())
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))
    }

    // -- ingest -------------------------------------------------------------

    /// Record one observation and feed it to the aggregator.  Returns a ticket
    /// when a cycle should run.
    pub fn observe(&self, mut obs: Observation) -> Result<TriggerDecision> {
        self.kind_of(&obs.task_id)?;
        let receipt = self.metrics.record(obs.clone())?;
        obs.id = receipt.id;
        self.after_resolved(&obs)
    }

    /// Attach late ground truth to a recorded prediction.
    pub fn record_outcome(&self, task_id: &str, observation_id: u64, actual: f64) -> Result<TriggerDecision> {
        self.kind_of(task_id)?;
        let resolved = self.metrics.record_outcome(task_id, observation_id, actual)?;
        self.after_resolved(&resolved)
    }

    fn after_resolved(&self, obs: &Observation) -> Result<TriggerDecision> {
        if !obs.is_resolved() {
            return Ok(TriggerDecision::None);
        }
        let capture_due = self.since_capture.lock().is_ok_and(|mut counts| {
            let n = counts.entry(obs.task_id.clone()).or_insert(0);
            *n += 1;
            if *n >= self.config.cycle.capture_every {
                *n = 0;
                true
            } else {
                false
            }
        });
        if capture_due {
            let snap = self.metrics.capture(&obs.task_id, Window::LastN(self.config.cycle.snapshot_window))?;
            tracing::debug!(target: "governor::control", task_id = %obs.task_id, score = snap.score, "snapshot captured");
        }

        let decision = self.feedback.ingest(obs);
        if decision.is_improve() {
            self.set_state(&obs.task_id, CycleState::Triggered);
        }
        Ok(decision)
    }

    /// Operator-initiated cycle, subject to the one-in-flight rule.
    pub fn request_cycle(&self, task_id: &str) -> Result<CycleTicket> {
        self.kind_of(task_id)?;
        let now = self.metrics.newest_timestamp(task_id).unwrap_or_else(now_ms);
        let ticket = self.feedback.request(task_id, now)?;
        self.set_state(task_id, CycleState::Triggered);
        tracing::info!(target: "governor::control", task_id, "manual cycle requested");
        Ok(ticket)
    }

    // -- cycle --------------------------------------------------------------

    fn set_state(&self, task_id: &str, state: CycleState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(task_id.to_string(), state);
        }
    }

    fn enter(&self, record: &mut CycleRecord, state: CycleState) {
        record.path.push(state);
        self.set_state(&record.task_id, state);
        tracing::debug!(target: "governor::control", task_id = %record.task_id, cycle = record.cycle_id, %state, "cycle state");
    }

    /// Drive one ticket to completion.  Never fails: faults end up in the
    /// returned record with `CycleOutcome::Error`.  A cycle that panics or
    /// is dropped mid-flight still leaves an error record and frees its task.
    pub async fn run_cycle(&self, ticket: CycleTicket) -> CycleRecord {
        let cycle_id = self.next_cycle_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = CycleGuard {
            owner: self,
            record: CycleRecord::open(cycle_id, &ticket, now_ms()),
            finished: false,
        };
        tracing::info!(
            target: "governor::control",
            task_id = %ticket.task_id,
            cycle = cycle_id,
            reason = %ticket.reason,
            "cycle started"
        );

        if let Err(e) = self.drive(&ticket, &mut guard.record).await {
            tracing::error!(target: "governor::control", task_id = %ticket.task_id, cycle = cycle_id, error = %e, "cycle faulted");
            guard.fail(e.to_string());
        }

        guard.finished = true;
        self.finish(guard.record.clone())
    }

    async fn drive(&self, ticket: &CycleTicket, record: &mut CycleRecord) -> Result<()> {
        let task_id = ticket.task_id.as_str();
        self.enter(record, CycleState::Triggered);
        let kind = self.kind_of(task_id)?;
        let constraints = self
            .constraints
            .read()
            .map(|c| Arc::clone(&c))
            .map_err(|_| GovernorError::Persistence("constraint lock poisoned".into()))?;

        let trigger = self.metrics.capture(task_id, Window::LastN(self.config.cycle.snapshot_window))?;
        self.pin_window(task_id, record.cycle_id, &trigger);

        if *self.stop_tx.borrow() {
            self.enter(record, CycleState::Discarding);
            record.reject("cancelled");
            return Ok(());
        }

        let strategy = self.selector.select(task_id, &self.metrics.history(task_id), ticket.issued_at_ms);
        record.strategy = Some(strategy);
        if strategy == Strategy::NoOp {
            self.enter(record, CycleState::Discarding);
            record.reject("no_op");
            return Ok(());
        }

        let mut stale_restarts = 0;
        loop {
            self.enter(record, CycleState::Generating);
            let active = self.versions.active(task_id)?;
            let modification = match self.generator.generate(task_id, strategy, &active, ticket.issued_at_ms) {
                Ok(m) => m,
                Err(e @ GovernorError::NoEligibleTransformation(_)) => {
                    tracing::warn!(target: "governor::control", task_id, error = %e, "architecture menu exhausted");
                    self.enter(record, CycleState::Discarding);
                    record.reject(e.to_string());
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            record.candidate_modification_id = Some(modification.id);

            self.enter(record, CycleState::Validating);
            let verdict = self.validator.validate(&modification, &constraints, &active.config);
            record.validator_verdict = Some(verdict.clone());
            if let Verdict::Reject(reason) = verdict {
                tracing::warn!(target: "governor::control", task_id, modification = modification.id, %reason, "candidate rejected");
                self.selector.report(task_id, strategy, false, ticket.issued_at_ms);
                self.enter(record, CycleState::Discarding);
                record.reject(reason);
                return Ok(());
            }

            self.enter(record, CycleState::ShadowTesting);
            let mut retries = 0;
            let outcome = loop {
                let outcome = self
                    .shadow
                    .evaluate(&modification, kind, &active.config, self.stop_tx.subscribe())
                    .await?;
                match outcome {
                    ShadowOutcome::Inconclusive { samples, required } if retries < self.config.cycle.max_shadow_retries => {
                        retries += 1;
                        tracing::info!(target: "governor::control", task_id, samples, required, retry = retries, "shadow inconclusive, retrying");
                    }
                    other => break other,
                }
            };
            record.shadow_verdict = Some(outcome.clone());

            let verdict = match outcome {
                ShadowOutcome::Verdict(v) => v,
                ShadowOutcome::Cancelled { .. } => {
                    self.enter(record, CycleState::Discarding);
                    record.reject("cancelled");
                    return Ok(());
                }
                ShadowOutcome::Inconclusive { samples, required } => {
                    self.enter(record, CycleState::Discarding);
                    record.reject(GovernorError::InconclusiveShadow { samples, required }.to_string());
                    return Ok(());
                }
            };
            if !verdict.improved {
                self.selector.report(task_id, strategy, false, ticket.issued_at_ms);
                self.enter(record, CycleState::Discarding);
                record.reject(format!("no improvement (delta {:+.4})", verdict.delta_metric));
                return Ok(());
            }

            self.enter(record, CycleState::Committing);
            match self.versions.commit(&modification, &verdict, now_ms()) {
                Ok(version) => {
                    self.selector.report(task_id, strategy, true, ticket.issued_at_ms);
                    record.final_outcome = CycleOutcome::Committed;
                    record.committed_version_id = Some(version.id);
                    return Ok(());
                }
                Err(e @ GovernorError::StaleParent { .. }) if stale_restarts < self.config.cycle.max_stale_restarts => {
                    stale_restarts += 1;
                    tracing::warn!(target: "governor::control", task_id, error = %e, "stale parent, regenerating");
                }
                Err(e @ GovernorError::StaleParent { .. }) => {
                    tracing::warn!(target: "governor::control", task_id, error = %e, "stale parent, restarts exhausted");
                    self.enter(record, CycleState::Discarding);
                    record.reject(e.to_string());
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pin the trigger window of the task's newest cycle, releasing the
    /// previous cycle's pin.
    fn pin_window(&self, task_id: &str, cycle_id: u64, trigger: &MetricSnapshot) {
        self.metrics.pin(task_id, cycle_id, trigger.window_start_ms);
        if let Ok(mut pinned) = self.pinned.lock() {
            if let Some(previous) = pinned.insert(task_id.to_string(), cycle_id) {
                self.metrics.unpin(task_id, previous);
            }
        }
    }

    fn finish(&self, mut record: CycleRecord) -> CycleRecord {
        record.finished_at_ms = now_ms();
        let task_id = record.task_id.clone();

        if let Err(e) = self.store.append_cycle(&record) {
            tracing::error!(target: "governor::control", task_id = %task_id, cycle = record.cycle_id, error = %e, "cycle record not persisted");
        }
        if let Ok(mut cycles) = self.cycles.lock() {
            cycles.entry(task_id.clone()).or_default().push(record.clone());
        }
        self.set_state(&task_id, CycleState::Idle);
        self.feedback.resolve(&task_id);

        tracing::info!(
            target: "governor::control",
            task_id = %task_id,
            cycle = record.cycle_id,
            outcome = %record.final_outcome,
            version = ?record.committed_version_id,
            detail = record.detail.as_deref().unwrap_or(""),
            "cycle finished"
        );
        record
    }

    /// Consume observations until the channel closes or `stop` is called,
    /// running each triggered cycle on its own task.  Waits for in-flight
    /// cycles and flushes the store before returning.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Observation>) -> Result<()> {
        let mut stop = self.stop_tx.subscribe();
        let mut cycles = JoinSet::new();
        tracing::info!(target: "governor::control", "control loop running");

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                next = rx.recv() => {
                    let Some(obs) = next else { break };
                    match self.observe(obs) {
                        Ok(TriggerDecision::Improve(ticket)) => {
                            let this = Arc::clone(&self);
                            cycles.spawn(async move { this.run_cycle(ticket).await });
                        }
                        Ok(TriggerDecision::None) => {}
                        Err(e) => tracing::warn!(target: "governor::control", error = %e, "observation dropped"),
                    }
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(target: "governor::control", error = %e, "cycle task panicked");
                    }
                }
            }
        }

        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                tracing::error!(target: "governor::control", error = %e, "cycle task panicked");
            }
        }
        self.store.flush()?;
        tracing::info!(target: "governor::control", "control loop stopped");
        Ok(())
    }

    /// Cancel in-flight shadow tests and refuse new cycles until `resume`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        tracing::info!(target: "governor::control", "stop signalled");
    }

    pub fn resume(&self) {
        self.stop_tx.send_replace(false);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Stop and flush the cycle log.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();
        self.store.flush()
    }

    // -- operator surface ---------------------------------------------------

    pub fn get_active_version(&self, task_id: &str) -> Result<Version> {
        self.versions.active(task_id)
    }

    /// Every retained version of the task, oldest first.
    pub fn get_versions(&self, task_id: &str) -> Result<Vec<Version>> {
        self.versions.history(task_id)
    }

    /// Cycle records in append order.
    pub fn get_cycle_history(&self, task_id: &str) -> Result<Vec<CycleRecord>> {
        self.cycles
            .lock()
            .map_err(|_| GovernorError::Persistence("cycle log lock poisoned".into()))?
            .get(task_id)
            .cloned()
            .ok_or_else(|| GovernorError::UnknownTask(task_id.to_string()))
    }

    /// Administrative revert, still subject to the ancestor check.
    pub fn force_revert(&self, task_id: &str, version_id: u64) -> Result<Version> {
        match self.versions.revert(task_id, version_id, now_ms()) {
            Ok(v) => {
                tracing::info!(target: "governor::control", task_id, version = v.id, "forced revert");
                Ok(v)
            }
            Err(e) => {
                tracing::warn!(target: "governor::control", task_id, target_version = version_id, error = %e, "forced revert refused");
                Err(e)
            }
        }
    }

    pub fn get_metrics(&self, task_id: &str, window: Window) -> Result<MetricSnapshot> {
        self.metrics.snapshot(task_id, window)
    }

    pub fn diff(&self, task_id: &str, from: u64, to: u64) -> Result<ConfigDiff> {
        self.versions.diff(task_id, from, to)
    }

    pub fn cycle_state(&self, task_id: &str) -> CycleState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(task_id).copied())
            .unwrap_or_default()
    }

    pub fn ladder_state(&self, task_id: &str) -> LadderState {
        self.selector.state(task_id)
    }

    /// Swap the constraint set.  Refused while any cycle is in flight.
    pub fn reload_constraints(&self, constraints: ConstraintSet) -> Result<()> {
        let in_flight = self.feedback.in_flight_count();
        if in_flight > 0 {
            return Err(GovernorError::CyclesInFlight(in_flight));
        }
        let mut slot = self
            .constraints
            .write()
            .map_err(|_| GovernorError::Persistence("constraint lock poisoned".into()))?;
        tracing::info!(
            target: "governor::control",
            from = slot.version,
            to = constraints.version,
            constraints = constraints.len(),
            "constraints reloaded"
        );
        *slot = Arc::new(constraints);
        Ok(())
    }

    pub fn constraints(&self) -> Arc<ConstraintSet> {
        self.constraints.read().map(|c| Arc::clone(&c)).unwrap_or_default()
    }

    /// Clear the escalation ladder and the architecture menu progress.
    pub fn reset_ladder(&self, task_id: &str) -> Result<()> {
        self.kind_of(task_id)?;
        self.selector.reset(task_id);
        self.generator.reset(task_id);
        Ok(())
    }

    /// Attach operator feedback to a task.
    pub fn annotate(&self, task_id: &str, note: &str, success: bool) -> Result<()> {
        self.kind_of(task_id)?;
        let entry = OperatorNote { task_id: task_id.to_string(), note: note.to_string(), success, at_ms: now_ms() };
        self.notes
            .lock()
            .map_err(|_| GovernorError::Persistence("notes lock poisoned".into()))?
            .entry(task_id.to_string())
            .or_default()
            .push(entry);
        tracing::info!(target: "governor::control", task_id, success, note, "operator note");
        Ok(())
    }

    pub fn notes(&self, task_id: &str) -> Vec<OperatorNote> {
        self.notes
            .lock()
            .ok()
            .and_then(|n| n.get(task_id).cloned())
            .unwrap_or_default()
    }

    pub fn summary(&self, task_id: &str) -> Result<PerformanceSummary> {
        let active = self.versions.active(task_id)?;
        let history = self.versions.history(task_id)?;
        let cycles = self.get_cycle_history(task_id)?;
        let notes = self.notes(task_id);

        let count = |o: CycleOutcome| cycles.iter().filter(|r| r.final_outcome == o).count();
        let committed = count(CycleOutcome::Committed);
        let mut by_kind = BTreeMap::new();
        for kind in history.iter().filter(|v| v.state != VersionState::Reverted).filter_map(Version::kind) {
            *by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }

        Ok(PerformanceSummary {
            task_id: task_id.to_string(),
            active_version: active.id,
            modifications_committed: history.iter().filter(|v| v.modification_id.is_some()).count(),
            cycles: cycles.len(),
            committed,
            rejected: count(CycleOutcome::Rejected),
            errored: count(CycleOutcome::Error),
            success_rate: if cycles.is_empty() { 0.0 } else { committed as f64 / cycles.len() as f64 },
            by_kind,
            ladder: self.selector.state(task_id),
            operator_notes: notes.len(),
            operator_successes: notes.iter().filter(|n| n.success).count(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
