//! # Stage: Shadow Tester
//!
//! ## Responsibility
//! Runs a candidate configuration next to the active one on mirrored traffic
//! and produces a paired verdict.  Every sample is scored under both
//! configurations, so the comparison is a per-sample difference rather than
//! two independent means.
//!
//! ## Guarantees
//! - Non-production: predictions are made with an explicit configuration and
//!   discarded; the live model is never touched
//! - Paired and deterministic: identical samples give an identical verdict
//! - Cancellable: a stop signal ends collection immediately with `Cancelled`
//! - Bounded: collection stops at `max_samples`, channel close, or the deadline
//!
//! ## NOT Responsible For
//! - Choosing what to test (that is the generator)
//! - Committing the winner (that is the version manager)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::Result;
use crate::model::{ModelConfig, TaskKind, TrainableModel};
use crate::self_modify::transform::Modification;

// ---------------------------------------------------------------------------
// Traffic
// ---------------------------------------------------------------------------

/// One mirrored input with its ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub input: Vec<f64>,
    pub actual: f64,
}

/// Source of mirrored traffic for shadow evaluation.
pub trait TrafficSource: Send + Sync {
    /// A fresh feed of samples for `task_id`.  The feed ends when the
    /// receiver is dropped or the source has nothing more to give.
    fn mirror(&self, task_id: &str) -> mpsc::Receiver<TrafficSample>;
}

/// Fixed, replayable samples per task.
#[derive(Debug, Default, Clone)]
pub struct ReplayTraffic {
    samples: HashMap<String, Vec<TrafficSample>>,
}

impl ReplayTraffic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples(mut self, task_id: &str, samples: Vec<TrafficSample>) -> Self {
        self.samples.insert(task_id.to_string(), samples);
        self
    }
}

impl TrafficSource for ReplayTraffic {
    fn mirror(&self, task_id: &str) -> mpsc::Receiver<TrafficSample> {
        let samples = self.samples.get(task_id).cloned().unwrap_or_default();
        let (tx, rx) = mpsc::channel(samples.len().max(1));
        for s in samples {
            if tx.try_send(s).is_err() {
                break;
            }
        }
        rx
    }
}

/// Live mirror: producers `publish`, each shadow test gets its own filtered feed.
#[derive(Debug, Clone)]
pub struct BroadcastMirror {
    tx: broadcast::Sender<(String, TrafficSample)>,
    feed_capacity: usize,
}

impl BroadcastMirror {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, feed_capacity: capacity.max(1) }
    }

    /// Mirror one production input.  Returns the number of active feeds.
    pub fn publish(&self, task_id: &str, sample: TrafficSample) -> usize {
        self.tx.send((task_id.to_string(), sample)).unwrap_or(0)
    }

    /// Feeds currently subscribed.  A feed detaches once its receiver is dropped.
    pub fn feed_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TrafficSource for BroadcastMirror {
    /// Must be called from within a tokio runtime.
    fn mirror(&self, task_id: &str) -> mpsc::Receiver<TrafficSample> {
        let (tx, rx) = mpsc::channel(self.feed_capacity);
        let mut sub = self.tx.subscribe();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = sub.recv() => match next {
                        Ok((task, sample)) if task == task_id => {
                            if tx.send(sample).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(target: "governor::shadow", skipped = n, "mirror feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        rx
    }
}

// ---------------------------------------------------------------------------
// Config + verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Below this many paired samples the result is `Inconclusive`.
    pub min_samples: usize,
    /// Collection stops once this many samples are held.
    pub max_samples: usize,
    /// Collection stops after this long regardless of sample count.
    pub deadline_ms: u64,
    /// Mean paired delta must exceed this to count as improved.
    pub min_improvement: f64,
    /// Also require the paired t-test to be significant.
    pub require_significance: bool,
    /// Confidence level for the significance check (e.g. 0.95).
    pub significance: f64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            min_samples: 30,
            max_samples: 200,
            deadline_ms: 5_000,
            min_improvement: 0.0,
            require_significance: false,
            significance: 0.95,
        }
    }
}

/// Paired comparison of candidate against active on the same samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowVerdict {
    pub improved: bool,
    /// Mean of per-sample (candidate − active) scores.
    pub delta_metric: f64,
    pub sample_count: usize,
    pub candidate_score: f64,
    pub active_score: f64,
    /// Two-tailed p-value of the paired t-test.
    pub p_value: f64,
}

/// What a shadow run ended with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShadowOutcome {
    Verdict(ShadowVerdict),
    Inconclusive { samples: usize, required: usize },
    Cancelled { samples: usize },
}

impl std::fmt::Display for ShadowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShadowOutcome::Verdict(v) => write!(
                f,
                "{} (delta {:+.4} over {} samples)",
                if v.improved { "improved" } else { "not improved" },
                v.delta_metric,
                v.sample_count
            ),
            ShadowOutcome::Inconclusive { samples, required } => write!(f, "inconclusive ({samples}/{required})"),
            ShadowOutcome::Cancelled { samples } => write!(f, "cancelled after {samples} samples"),
        }
    }
}

// ---------------------------------------------------------------------------
// Paired statistics
// ---------------------------------------------------------------------------

/// Two-tailed p-value of a one-sample t-test of `diffs` against zero.
fn paired_p_value(diffs: &[f64]) -> f64 {
    let n = diffs.len() as f64;
    if n < 2.0 {
        return 1.0;
    }
    let mean = diffs.iter().sum::<f64>() / n;
    let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
    if var <= 0.0 {
        return if mean.abs() < 1e-12 { 1.0 } else { 0.0 };
    }
    let t = mean / (var / n).sqrt();
    approx_two_tailed_p(t.abs(), n - 1.0)
}

fn approx_two_tailed_p(t_abs: f64, df: f64) -> f64 {
    let z = if df > 100.0 { t_abs } else { t_abs * (1.0 - 0.25 / df.max(1.0)) };
    (2.0 * standard_normal_upper_tail(z)).min(1.0)
}

/// Abramowitz & Stegun 26.2.17.
fn standard_normal_upper_tail(x: f64) -> f64 {
    if x < 0.0 { return 1.0 - standard_normal_upper_tail(-x); }
    if x > 8.0 { return 0.0; }
    let t = 1.0 / (1.0 + 0.2316419 * x);
    let poly = t * (0.319381530
        + t * (-0.356563782
        + t * (1.781477937
        + t * (-1.821255978
        + t * 1.330274429))));
    let pdf = (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
    pdf * poly
}

// ---------------------------------------------------------------------------
// ShadowTester
// ---------------------------------------------------------------------------

pub struct ShadowTester {
    config: ShadowConfig,
    model: Arc<dyn TrainableModel>,
    traffic: Arc<dyn TrafficSource>,
}

impl std::fmt::Debug for ShadowTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowTester").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ShadowTester {
    pub fn new(config: ShadowConfig, model: Arc<dyn TrainableModel>, traffic: Arc<dyn TrafficSource>) -> Self {
        Self { config, model, traffic }
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Score `candidate` against `active` on `samples`.  Pure given a
    /// deterministic model.
    pub fn evaluate_samples(
        &self,
        task_id: &str,
        kind: TaskKind,
        active: &ModelConfig,
        candidate: &ModelConfig,
        samples: &[TrafficSample],
    ) -> Result<ShadowOutcome> {
        if samples.len() < self.config.min_samples {
            return Ok(ShadowOutcome::Inconclusive { samples: samples.len(), required: self.config.min_samples });
        }
        let mut diffs = Vec::with_capacity(samples.len());
        let mut cand_total = 0.0;
        let mut active_total = 0.0;
        for s in samples {
            let a = kind.sample_score(self.model.predict(task_id, active, &s.input)?, s.actual);
            let c = kind.sample_score(self.model.predict(task_id, candidate, &s.input)?, s.actual);
            active_total += a;
            cand_total += c;
            diffs.push(c - a);
        }
        let n = samples.len() as f64;
        let delta_metric = diffs.iter().sum::<f64>() / n;
        let p_value = paired_p_value(&diffs);
        let significant = p_value < 1.0 - self.config.significance;
        let improved = delta_metric > self.config.min_improvement
            && (!self.config.require_significance || significant);

        Ok(ShadowOutcome::Verdict(ShadowVerdict {
            improved,
            delta_metric,
            sample_count: samples.len(),
            candidate_score: cand_total / n,
            active_score: active_total / n,
            p_value,
        }))
    }

    /// Collect mirrored traffic for `modification`'s task and evaluate it
    /// against `active`.  Returns `Cancelled` as soon as `cancel` reads `true`.
    pub async fn evaluate(
        &self,
        modification: &Modification,
        kind: TaskKind,
        active: &ModelConfig,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ShadowOutcome> {
        let task_id = modification.task_id.as_str();
        let candidate = modification.apply_to(active)?;
        let mut feed = self.traffic.mirror(task_id);
        let deadline = tokio::time::sleep(Duration::from_millis(self.config.deadline_ms));
        tokio::pin!(deadline);

        let mut samples = Vec::new();
        let mut cancel_open = true;
        loop {
            if *cancel.borrow() {
                tracing::info!(target: "governor::shadow", task_id, samples = samples.len(), "shadow test cancelled");
                return Ok(ShadowOutcome::Cancelled { samples: samples.len() });
            }
            tokio::select! {
                biased;
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
                next = feed.recv() => match next {
                    Some(s) => {
                        samples.push(s);
                        if samples.len() >= self.config.max_samples {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::debug!(target: "governor::shadow", task_id, samples = samples.len(), "shadow deadline reached");
                    break;
                }
            }
        }

        let outcome = self.evaluate_samples(task_id, kind, active, &candidate, &samples)?;
        tracing::info!(
            target: "governor::shadow",
            task_id,
            modification_id = modification.id,
            %outcome,
            "shadow test finished"
        );
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SimulatedModel;
    use crate::self_modify::transform::{ModificationKind, Transformation};

    fn active() -> ModelConfig {
        ModelConfig::default().with_param("learning_rate", 0.04).with_layers(&[64, 32])
    }

    fn better_lr() -> Modification {
        Modification {
            id: 1,
            task_id: "t1".into(),
            kind: ModificationKind::Hyperparameter,
            payload: vec![Transformation::SetParam { name: "learning_rate".into(), from: 0.04, to: 0.02 }],
            proposed_at_ms: 0,
            parent_version_id: 0,
        }
    }

    fn grid(n: usize) -> Vec<TrafficSample> {
        (0..n)
            .map(|i| TrafficSample { input: vec![1.0, (i as f64 + 0.5) / n as f64], actual: 1.0 })
            .collect()
    }

    fn model() -> Arc<SimulatedModel> {
        let m = SimulatedModel::new();
        m.add_task("t1", TaskKind::Classification, active(), 0.01);
        Arc::new(m)
    }

    fn tester(config: ShadowConfig, traffic: Arc<dyn TrafficSource>) -> ShadowTester {
        ShadowTester::new(config, model(), traffic)
    }

    #[test]
    fn test_inconclusive_below_min_samples() {
        let t = tester(ShadowConfig::default(), Arc::new(ReplayTraffic::new()));
        let cand = better_lr().apply_to(&active()).unwrap();
        let out = t.evaluate_samples("t1", TaskKind::Classification, &active(), &cand, &grid(29)).unwrap();
        assert_eq!(out, ShadowOutcome::Inconclusive { samples: 29, required: 30 });
    }

    #[test]
    fn test_paired_delta_deterministic() {
        let t = tester(ShadowConfig::default(), Arc::new(ReplayTraffic::new()));
        let cand = better_lr().apply_to(&active()).unwrap();
        let a = t.evaluate_samples("t1", TaskKind::Classification, &active(), &cand, &grid(40)).unwrap();
        let b = t.evaluate_samples("t1", TaskKind::Classification, &active(), &cand, &grid(40)).unwrap();
        assert_eq!(a, b);
        match a {
            ShadowOutcome::Verdict(v) => {
                assert!(v.improved);
                assert!(v.delta_metric > 0.0);
                assert_eq!(v.sample_count, 40);
                assert!((v.delta_metric - (v.candidate_score - v.active_score)).abs() < 1e-12);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_identical_config_not_improved() {
        let t = tester(ShadowConfig::default(), Arc::new(ReplayTraffic::new()));
        match t.evaluate_samples("t1", TaskKind::Classification, &active(), &active(), &grid(40)).unwrap() {
            ShadowOutcome::Verdict(v) => {
                assert!(!v.improved);
                assert_eq!(v.delta_metric, 0.0);
                assert_eq!(v.p_value, 1.0);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_paired_p_value_edges() {
        assert_eq!(paired_p_value(&[0.1]), 1.0);
        assert_eq!(paired_p_value(&[0.2, 0.2, 0.2]), 0.0);
        let p = paired_p_value(&[1.0, -1.0, 1.0, -1.0]);
        assert!(p > 0.9);
    }

    #[tokio::test]
    async fn test_evaluate_replay_reaches_verdict() {
        let traffic = ReplayTraffic::new().with_samples("t1", grid(40));
        let t = tester(ShadowConfig::default(), Arc::new(traffic));
        let (_tx, rx) = watch::channel(false);
        let out = t.evaluate(&better_lr(), TaskKind::Classification, &active(), rx).await.unwrap();
        assert!(matches!(out, ShadowOutcome::Verdict(ref v) if v.improved && v.sample_count == 40));
    }

    #[tokio::test]
    async fn test_evaluate_stops_at_max_samples() {
        let traffic = ReplayTraffic::new().with_samples("t1", grid(100));
        let t = tester(ShadowConfig { max_samples: 50, ..Default::default() }, Arc::new(traffic));
        let (_tx, rx) = watch::channel(false);
        match t.evaluate(&better_lr(), TaskKind::Classification, &active(), rx).await.unwrap() {
            ShadowOutcome::Verdict(v) => assert_eq!(v.sample_count, 50),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_evaluate_inconclusive_on_short_feed() {
        let traffic = ReplayTraffic::new().with_samples("t1", grid(10));
        let t = tester(ShadowConfig::default(), Arc::new(traffic));
        let (_tx, rx) = watch::channel(false);
        let out = t.evaluate(&better_lr(), TaskKind::Classification, &active(), rx).await.unwrap();
        assert_eq!(out, ShadowOutcome::Inconclusive { samples: 10, required: 30 });
    }

    #[tokio::test]
    async fn test_evaluate_cancelled_by_stop_signal() {
        let mirror = BroadcastMirror::new(64);
        let t = tester(ShadowConfig { deadline_ms: 60_000, ..Default::default() }, Arc::new(mirror.clone()));
        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });
        let out = t.evaluate(&better_lr(), TaskKind::Classification, &active(), rx).await.unwrap();
        stopper.await.unwrap();
        assert!(matches!(out, ShadowOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_mirror_filters_by_task() {
        let mirror = BroadcastMirror::new(64);
        let mut feed = mirror.mirror("t1");
        tokio::task::yield_now().await;
        mirror.publish("other", TrafficSample { input: vec![0.0, 0.0], actual: 0.0 });
        mirror.publish("t1", TrafficSample { input: vec![1.0, 0.5], actual: 1.0 });
        let got = tokio::time::timeout(Duration::from_secs(1), feed.recv()).await.unwrap().unwrap();
        assert_eq!(got.actual, 1.0);
    }

    #[tokio::test]
    async fn test_evaluate_deadline_without_traffic() {
        let mirror = BroadcastMirror::new(8);
        let t = tester(ShadowConfig { deadline_ms: 100, ..Default::default() }, Arc::new(mirror));
        let (_tx, rx) = watch::channel(false);
        let out = t.evaluate(&better_lr(), TaskKind::Classification, &active(), rx).await.unwrap();
        assert_eq!(out, ShadowOutcome::Inconclusive { samples: 0, required: 30 });
    }

    #[tokio::test]
    async fn test_finished_shadow_tests_release_their_feeds() {
        let mirror = BroadcastMirror::new(8);
        let t = tester(ShadowConfig { deadline_ms: 50, ..Default::default() }, Arc::new(mirror.clone()));
        for _ in 0..3 {
            let (_tx, rx) = watch::channel(false);
            t.evaluate(&better_lr(), TaskKind::Classification, &active(), rx).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while mirror.feed_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(mirror.publish("other", TrafficSample { input: vec![0.0, 0.0], actual: 0.0 }), 0);
    }
}
