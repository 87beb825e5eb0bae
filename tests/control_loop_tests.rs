//! End-to-end cycles through the control loop: degradation triggering a
//! tuned commit, a candidate stopped by the safety gate, operator reverts,
//! stale-parent restarts, an exhausted menu, cancellation and model panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use adaptive_governor::config::GovernorConfig;
use adaptive_governor::control::{ControlLoop, CycleOutcome, CycleRecord, CycleState};
use adaptive_governor::model::{ApplyHandle, ModelConfig, TaskKind, TrainableModel};
use adaptive_governor::self_modify::generator::GeneratorConfig;
use adaptive_governor::self_modify::safety::{Constraint, ConstraintKind, ConstraintSet, Verdict};
use adaptive_governor::self_modify::store::MemoryStore;
use adaptive_governor::self_modify::transform::Modification;
use adaptive_governor::self_tune::feedback::{CycleTicket, TriggerDecision, TriggerReason};
use adaptive_governor::self_tune::metric_store::{Observation, Window};
use adaptive_governor::self_tune::shadow::{ReplayTraffic, ShadowOutcome, TrafficSample, TrafficSource};
use adaptive_governor::self_tune::strategy::Strategy;
use adaptive_governor::self_tune::version::VersionState;
use adaptive_governor::{GovernorError, Result};
use tokio::sync::mpsc;

const TASK: &str = "t1";
const BASE_LR: f64 = 0.1;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Answers correctly iff `u < q`, with `q = 0.60` at the starting learning
/// rate and `0.65` at any other.
struct StepModel {
    handles: AtomicU64,
}

impl StepModel {
    fn new() -> Self {
        Self { handles: AtomicU64::new(1) }
    }
}

impl TrainableModel for StepModel {
    fn predict(&self, _task_id: &str, config: &ModelConfig, input: &[f64]) -> Result<f64> {
        let q = if config.params.get("learning_rate") == Some(&BASE_LR) { 0.60 } else { 0.65 };
        let (target, u) = (input[0], input[1]);
        Ok(if u < q { target } else { 1.0 - target })
    }

    fn apply(&self, task_id: &str, modification: &Modification, _resulting: &ModelConfig) -> Result<ApplyHandle> {
        Ok(ApplyHandle {
            id: self.handles.fetch_add(1, Ordering::Relaxed),
            task_id: task_id.to_string(),
            modification_id: modification.id,
        })
    }

    fn rollback(&self, _task_id: &str, _handle: ApplyHandle) -> Result<()> {
        Ok(())
    }
}

/// Answers correctly iff `u < 0.5 + learning_rate`, so every step up in
/// learning rate is an improvement.
struct RisingModel {
    handles: AtomicU64,
}

impl TrainableModel for RisingModel {
    fn predict(&self, _task_id: &str, config: &ModelConfig, input: &[f64]) -> Result<f64> {
        let lr = config.params.get("learning_rate").copied().unwrap_or(0.0);
        let q = (0.5 + lr).min(0.95);
        let (target, u) = (input[0], input[1]);
        Ok(if u < q { target } else { 1.0 - target })
    }

    fn apply(&self, task_id: &str, modification: &Modification, _resulting: &ModelConfig) -> Result<ApplyHandle> {
        Ok(ApplyHandle {
            id: self.handles.fetch_add(1, Ordering::Relaxed),
            task_id: task_id.to_string(),
            modification_id: modification.id,
        })
    }

    fn rollback(&self, _task_id: &str, _handle: ApplyHandle) -> Result<()> {
        Ok(())
    }
}

struct PanickingModel;

impl TrainableModel for PanickingModel {
    fn predict(&self, _task_id: &str, _config: &ModelConfig, _input: &[f64]) -> Result<f64> {
        panic!("model crashed mid-prediction")
    }

    fn apply(&self, task_id: &str, modification: &Modification, _resulting: &ModelConfig) -> Result<ApplyHandle> {
        Ok(ApplyHandle { id: 1, task_id: task_id.to_string(), modification_id: modification.id })
    }

    fn rollback(&self, _task_id: &str, _handle: ApplyHandle) -> Result<()> {
        Ok(())
    }
}

/// Hands each shadow feed to the test, which decides what flows through it
/// and when it closes.
struct ManualTraffic {
    feeds: mpsc::UnboundedSender<mpsc::Sender<TrafficSample>>,
}

impl ManualTraffic {
    fn new() -> (Self, mpsc::UnboundedReceiver<mpsc::Sender<TrafficSample>>) {
        let (feeds, rx) = mpsc::unbounded_channel();
        (Self { feeds }, rx)
    }
}

impl TrafficSource for ManualTraffic {
    fn mirror(&self, _task_id: &str) -> mpsc::Receiver<TrafficSample> {
        let (tx, rx) = mpsc::channel(64);
        let _ = self.feeds.send(tx);
        rx
    }
}

/// Wait for the next shadow feed, push the grid through it and close it.
async fn serve(feeds: &mut mpsc::UnboundedReceiver<mpsc::Sender<TrafficSample>>) {
    let feed = feeds.recv().await.expect("a shadow test should open a feed");
    for s in grid() {
        feed.send(s).await.unwrap();
    }
}

fn initial() -> ModelConfig {
    ModelConfig::default().with_param("learning_rate", BASE_LR).with_layers(&[32, 32])
}

/// Forty paired samples on an even grid of `u`.
fn grid() -> Vec<TrafficSample> {
    (0..40)
        .map(|i| TrafficSample { input: vec![1.0, (i as f64 + 0.5) / 40.0], actual: 1.0 })
        .collect()
}

fn constraints(max_deviation: f64) -> ConstraintSet {
    ConstraintSet {
        version: 1,
        constraints: vec![
            Constraint {
                name: "lr_range".into(),
                kind: ConstraintKind::BoundedRange { param: "learning_rate".into(), min: 1e-4, max: 1.0 },
            },
            Constraint { name: "step".into(), kind: ConstraintKind::MaxDeviation { limit: max_deviation } },
        ],
    }
}

fn build(config: GovernorConfig, set: ConstraintSet) -> ControlLoop {
    build_with(
        config,
        set,
        Arc::new(StepModel::new()),
        Arc::new(ReplayTraffic::new().with_samples(TASK, grid())),
    )
}

fn build_with(
    config: GovernorConfig,
    set: ConstraintSet,
    model: Arc<dyn TrainableModel>,
    traffic: Arc<dyn TrafficSource>,
) -> ControlLoop {
    let lp = ControlLoop::new(config, set, model, traffic, Arc::new(MemoryStore::new())).unwrap();
    lp.register_task(TASK, TaskKind::Classification, initial()).unwrap();
    lp
}

/// Learning-rate steps of 1.5x to 2x, under a rising model fed by hand.
fn rising(max_stale_restarts: u32) -> (Arc<ControlLoop>, mpsc::UnboundedReceiver<mpsc::Sender<TrafficSample>>) {
    let mut config = GovernorConfig {
        generator: GeneratorConfig { factor_min: 1.5, factor_max: 2.0, ..Default::default() },
        ..Default::default()
    };
    config.cycle.max_stale_restarts = max_stale_restarts;
    let (traffic, feeds) = ManualTraffic::new();
    let model = Arc::new(RisingModel { handles: AtomicU64::new(1) });
    (Arc::new(build_with(config, constraints(1.5), model, Arc::new(traffic))), feeds)
}

/// Commit v1 from a degradation cycle, then open a manual cycle on top of it
/// and return it once its shadow feed is open.
async fn second_cycle_in_shadow(
    lp: &Arc<ControlLoop>,
    feeds: &mut mpsc::UnboundedReceiver<mpsc::Sender<TrafficSample>>,
) -> (tokio::task::JoinHandle<CycleRecord>, mpsc::Sender<TrafficSample>) {
    let ticket = degrade(lp);
    let first = tokio::spawn({
        let lp = Arc::clone(lp);
        async move { lp.run_cycle(ticket).await }
    });
    serve(feeds).await;
    assert_eq!(first.await.unwrap().final_outcome, CycleOutcome::Committed);
    assert_eq!(lp.get_active_version(TASK).unwrap().id, 1);

    let ticket = lp.request_cycle(TASK).unwrap();
    let second = tokio::spawn({
        let lp = Arc::clone(lp);
        async move { lp.run_cycle(ticket).await }
    });
    let feed = feeds.recv().await.expect("second cycle should reach shadow testing");
    (second, feed)
}

/// `correct` of every five observations are right.
fn obs(i: u64, correct_per_five: u64) -> Observation {
    let predicted = if i % 5 < correct_per_five { 1.0 } else { 0.0 };
    Observation::new(TASK, TaskKind::Classification, i * 1_000, predicted, Some(1.0))
}

/// 50 observations at 0.80 accuracy followed by 50 at 0.60.  Returns the
/// first ticket issued.
fn degrade(lp: &ControlLoop) -> CycleTicket {
    for i in 0..50 {
        assert!(!lp.observe(obs(i, 4)).unwrap().is_improve(), "healthy traffic must not trigger");
    }
    assert!((lp.get_metrics(TASK, Window::LastN(50)).unwrap().score - 0.80).abs() < 1e-12);

    let mut ticket = None;
    for i in 50..100 {
        if let TriggerDecision::Improve(t) = lp.observe(obs(i, 3)).unwrap() {
            assert!(ticket.is_none(), "second trigger must be suppressed while in flight");
            ticket = Some(t);
        }
    }
    ticket.expect("degradation should trigger a cycle")
}

// ---------------------------------------------------------------------------
// Degradation → tune → commit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_degradation_tunes_and_commits_v1() {
    let lp = build(GovernorConfig::default(), constraints(1.5));
    let ticket = degrade(&lp);
    assert!(matches!(ticket.reason, TriggerReason::Degradation { .. }));
    assert_eq!(lp.cycle_state(TASK), CycleState::Triggered);

    let record = lp.run_cycle(ticket).await;

    assert_eq!(record.strategy, Some(Strategy::HyperparameterTune));
    assert_eq!(record.validator_verdict, Some(Verdict::Pass));
    let Some(ShadowOutcome::Verdict(v)) = &record.shadow_verdict else {
        panic!("expected a shadow verdict, got {:?}", record.shadow_verdict)
    };
    assert!(v.improved);
    assert_eq!(v.sample_count, 40);
    assert!((v.delta_metric - 0.05).abs() < 1e-12);
    assert_eq!(record.final_outcome, CycleOutcome::Committed);
    assert_eq!(
        record.path,
        vec![
            CycleState::Triggered,
            CycleState::Generating,
            CycleState::Validating,
            CycleState::ShadowTesting,
            CycleState::Committing,
        ]
    );

    let active = lp.get_active_version(TASK).unwrap();
    assert_eq!(Some(active.id), record.committed_version_id);
    assert_eq!(active.id, 1);
    assert_eq!(active.parent_id, Some(0));
    assert_ne!(active.config.params["learning_rate"], BASE_LR);
    let versions = lp.get_versions(TASK).unwrap();
    assert_eq!(versions[0].state, VersionState::Superseded);
    assert_eq!(lp.get_cycle_history(TASK).unwrap(), vec![record]);
    assert_eq!(lp.cycle_state(TASK), CycleState::Idle);

    let summary = lp.summary(TASK).unwrap();
    assert_eq!(summary.committed, 1);
    assert_eq!(summary.by_kind.get("hyperparameter"), Some(&1));
}

// ---------------------------------------------------------------------------
// Safety gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_excess_deviation_rejected_before_shadow() {
    let config = GovernorConfig {
        generator: GeneratorConfig { factor_min: 1.5, factor_max: 2.0, ..Default::default() },
        ..Default::default()
    };
    let lp = build(config, constraints(0.25));
    let record = lp.run_cycle(degrade(&lp)).await;

    assert_eq!(record.validator_verdict, Some(Verdict::Reject("max_deviation exceeded".into())));
    assert_eq!(record.final_outcome, CycleOutcome::Rejected);
    assert!(record.shadow_verdict.is_none());
    assert!(!record.path.contains(&CycleState::ShadowTesting));
    assert_eq!(lp.get_active_version(TASK).unwrap().id, 0);
    assert_eq!(lp.get_versions(TASK).unwrap().len(), 1);
}

#[tokio::test]
async fn test_reload_between_cycles_applies_to_next_cycle() {
    let lp = build(GovernorConfig::default(), constraints(0.0));
    let first = lp.run_cycle(degrade(&lp)).await;
    assert_eq!(first.final_outcome, CycleOutcome::Rejected);

    lp.reload_constraints(constraints(1.5)).unwrap();
    let second = lp.run_cycle(lp.request_cycle(TASK).unwrap()).await;
    assert_eq!(second.validator_verdict, Some(Verdict::Pass));
    assert_eq!(second.trigger_reason, TriggerReason::Manual);
}

// ---------------------------------------------------------------------------
// Revert
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_revert_to_parent_and_unknown_version() {
    let lp = build(GovernorConfig::default(), constraints(1.5));
    let record = lp.run_cycle(degrade(&lp)).await;
    assert_eq!(record.final_outcome, CycleOutcome::Committed);

    let err = lp.force_revert(TASK, 99).unwrap_err();
    assert!(matches!(err, GovernorError::UnknownVersion(99)));
    assert_eq!(lp.get_active_version(TASK).unwrap().id, 1);

    let v0 = lp.force_revert(TASK, 0).unwrap();
    assert_eq!(v0.id, 0);
    assert_eq!(v0.state, VersionState::Active);
    assert_eq!(v0.config, initial());
    let versions = lp.get_versions(TASK).unwrap();
    assert_eq!(versions[1].state, VersionState::Reverted);
    assert_eq!(versions.iter().filter(|v| v.is_active()).count(), 1);
}

#[tokio::test]
async fn test_revert_across_branch_is_not_an_ancestor() {
    let lp = build(GovernorConfig::default(), constraints(1.5));
    assert_eq!(lp.run_cycle(degrade(&lp)).await.final_outcome, CycleOutcome::Committed);
    lp.force_revert(TASK, 0).unwrap();

    let second = lp.run_cycle(lp.request_cycle(TASK).unwrap()).await;
    assert_eq!(second.final_outcome, CycleOutcome::Committed);
    let v2 = lp.get_active_version(TASK).unwrap();
    assert_eq!(v2.parent_id, Some(0));

    let err = lp.force_revert(TASK, 1).unwrap_err();
    assert!(matches!(err, GovernorError::NotAnAncestor { target: 1, .. }));
    assert_eq!(lp.get_active_version(TASK).unwrap().id, v2.id);

    let diff = lp.diff(TASK, 0, v2.id).unwrap();
    assert!(diff.params.iter().any(|d| d.name == "learning_rate"));
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_consumes_channel_and_commits() {
    let lp = Arc::new(build(GovernorConfig::default(), constraints(1.5)));
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let handle = tokio::spawn(Arc::clone(&lp).run(rx));

    for i in 0..50 {
        tx.send(obs(i, 4)).await.unwrap();
    }
    for i in 50..100 {
        tx.send(obs(i, 3)).await.unwrap();
    }
    drop(tx);
    handle.await.unwrap().unwrap();

    let history = lp.get_cycle_history(TASK).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].final_outcome, CycleOutcome::Committed);
    assert_eq!(lp.get_active_version(TASK).unwrap().id, 1);
}

#[tokio::test]
async fn test_manual_then_ladder_reset() {
    let lp = build(GovernorConfig::default(), constraints(0.0));
    let first = lp.run_cycle(degrade(&lp)).await;
    assert_eq!(first.strategy, Some(Strategy::HyperparameterTune));
    // the rejected tune escalates; architecture candidates are still rejected by the zero cap
    let second = lp.run_cycle(lp.request_cycle(TASK).unwrap()).await;
    assert_eq!(second.strategy, Some(Strategy::ArchitectureAdjust));
    let third = lp.run_cycle(lp.request_cycle(TASK).unwrap()).await;
    assert_eq!(third.strategy, Some(Strategy::ArchitectureAdjust));

    lp.reset_ladder(TASK).unwrap();
    let fourth = lp.run_cycle(lp.request_cycle(TASK).unwrap()).await;
    assert_eq!(fourth.strategy, Some(Strategy::HyperparameterTune));
    assert_eq!(lp.summary(TASK).unwrap().rejected, 4);
}

// ---------------------------------------------------------------------------
// Stale parent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stale_parent_regenerates_against_new_active() {
    let (lp, mut feeds) = rising(1);
    let (second, feed) = second_cycle_in_shadow(&lp, &mut feeds).await;

    // the candidate was built on v1; move the task back to v0 under it
    lp.force_revert(TASK, 0).unwrap();
    for s in grid() {
        feed.send(s).await.unwrap();
    }
    drop(feed);
    serve(&mut feeds).await;

    let record = second.await.unwrap();
    assert_eq!(record.final_outcome, CycleOutcome::Committed);
    assert_eq!(
        record.path,
        vec![
            CycleState::Triggered,
            CycleState::Generating,
            CycleState::Validating,
            CycleState::ShadowTesting,
            CycleState::Committing,
            CycleState::Generating,
            CycleState::Validating,
            CycleState::ShadowTesting,
            CycleState::Committing,
        ]
    );
    let active = lp.get_active_version(TASK).unwrap();
    assert_eq!(active.id, 2);
    assert_eq!(active.parent_id, Some(0));
    assert_eq!(record.committed_version_id, Some(2));
    assert_eq!(active.modification_id, record.candidate_modification_id);
    let versions = lp.get_versions(TASK).unwrap();
    assert_eq!(versions[1].state, VersionState::Reverted);
    assert_eq!(versions.iter().filter(|v| v.is_active()).count(), 1);
}

#[tokio::test]
async fn test_stale_parent_without_restarts_left_is_rejected() {
    let (lp, mut feeds) = rising(0);
    let (second, feed) = second_cycle_in_shadow(&lp, &mut feeds).await;

    lp.force_revert(TASK, 0).unwrap();
    for s in grid() {
        feed.send(s).await.unwrap();
    }
    drop(feed);

    let record = second.await.unwrap();
    assert_eq!(record.final_outcome, CycleOutcome::Rejected);
    assert!(record.detail.as_deref().is_some_and(|d| d.contains("stale parent")), "{:?}", record.detail);
    assert_eq!(&record.path[record.path.len() - 2..], &[CycleState::Committing, CycleState::Discarding]);
    assert!(record.committed_version_id.is_none());
    assert_eq!(lp.get_active_version(TASK).unwrap().id, 0);
    assert_eq!(lp.get_versions(TASK).unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Exhausted menu, cancellation, panics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_exhausted_menu_discards_without_verdict() {
    let lp = build(GovernorConfig::default(), constraints(0.0));
    let mut strategies = vec![lp.run_cycle(degrade(&lp)).await.strategy];
    // widen, append and narrow are the only entries this config admits
    for _ in 0..3 {
        let record = lp.run_cycle(lp.request_cycle(TASK).unwrap()).await;
        assert_eq!(record.validator_verdict, Some(Verdict::Reject("max_deviation exceeded".into())));
        strategies.push(record.strategy);
    }
    assert_eq!(
        strategies,
        vec![
            Some(Strategy::HyperparameterTune),
            Some(Strategy::ArchitectureAdjust),
            Some(Strategy::ArchitectureAdjust),
            Some(Strategy::ArchitectureAdjust),
        ]
    );

    let record = lp.run_cycle(lp.request_cycle(TASK).unwrap()).await;
    assert_eq!(record.strategy, Some(Strategy::ArchitectureAdjust));
    assert_eq!(record.final_outcome, CycleOutcome::Rejected);
    assert_eq!(record.detail.as_deref(), Some("no eligible transformation for task t1"));
    assert_eq!(record.path, vec![CycleState::Triggered, CycleState::Generating, CycleState::Discarding]);
    assert!(record.validator_verdict.is_none());
    assert!(record.candidate_modification_id.is_none());
    assert_eq!(lp.cycle_state(TASK), CycleState::Idle);
    assert_eq!(lp.get_active_version(TASK).unwrap().id, 0);
}

#[tokio::test]
async fn test_stop_during_shadow_cancels_cycle() {
    let (traffic, mut feeds) = ManualTraffic::new();
    let lp = Arc::new(build_with(
        GovernorConfig::default(),
        constraints(1.5),
        Arc::new(StepModel::new()),
        Arc::new(traffic),
    ));
    let ticket = degrade(&lp);
    let cycle = tokio::spawn({
        let lp = Arc::clone(&lp);
        async move { lp.run_cycle(ticket).await }
    });

    // keep the feed open so only the stop signal can end the shadow test
    let _feed = feeds.recv().await.expect("cycle should reach shadow testing");
    lp.stop();
    let record = cycle.await.unwrap();

    assert_eq!(record.final_outcome, CycleOutcome::Rejected);
    assert_eq!(record.detail.as_deref(), Some("cancelled"));
    assert_eq!(record.shadow_verdict, Some(ShadowOutcome::Cancelled { samples: 0 }));
    assert_eq!(
        record.path,
        vec![
            CycleState::Triggered,
            CycleState::Generating,
            CycleState::Validating,
            CycleState::ShadowTesting,
            CycleState::Discarding,
        ]
    );
    assert_eq!(lp.get_active_version(TASK).unwrap().id, 0);
    assert_eq!(lp.get_versions(TASK).unwrap().len(), 1);
}

#[tokio::test]
async fn test_panicking_cycle_still_records_and_frees_task() {
    let lp = Arc::new(build_with(
        GovernorConfig::default(),
        constraints(1.5),
        Arc::new(PanickingModel),
        Arc::new(ReplayTraffic::new().with_samples(TASK, grid())),
    ));
    let ticket = degrade(&lp);
    let joined = tokio::spawn({
        let lp = Arc::clone(&lp);
        async move { lp.run_cycle(ticket).await }
    })
    .await;
    assert!(joined.unwrap_err().is_panic());

    let history = lp.get_cycle_history(TASK).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].final_outcome, CycleOutcome::Error);
    assert_eq!(history[0].detail.as_deref(), Some("cycle aborted before completion"));
    assert_eq!(history[0].path.last(), Some(&CycleState::Discarding));
    assert_eq!(lp.cycle_state(TASK), CycleState::Idle);

    lp.reload_constraints(constraints(1.0)).unwrap();
    assert_eq!(lp.request_cycle(TASK).unwrap().task_id, TASK);
}
