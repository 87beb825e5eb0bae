//! # Stage: Modification Generator
//!
//! ## Responsibility
//! Turns a strategy and the active version into one candidate
//! [`Modification`]:
//!
//! - `hyperparameter_tune`: scale one tunable parameter by a log-uniform
//!   factor in `[factor_min, factor_max]`, drawn from a per-task seeded RNG
//! - `architecture_adjust`: the next untried entry of a fixed menu of
//!   structural edits; only entries whose every step has an inverse qualify
//!
//! ## Guarantees
//! - Reproducible: the same seed and call sequence gives the same candidates
//! - Revertible: every emitted modification has a full inverse payload
//! - Monotonic ids, resumable after restart via [`ModificationGenerator::resume_ids`]
//!
//! ## NOT Responsible For
//! - Safety checks (that is the validator)
//! - Retrying after the menu is exhausted; only an operator reset re-arms it

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};
use crate::model::ModelConfig;
use crate::self_modify::transform::{Modification, ModificationKind, Transformation};
use crate::self_tune::strategy::Strategy;
use crate::self_tune::version::Version;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub seed: u64,
    pub factor_min: f64,
    pub factor_max: f64,
    /// Parameters the tuner may perturb, when present in the config.
    pub tunable_params: Vec<String>,
    /// Units added or removed by the widen / narrow menu entries.
    pub width_step: u32,
    /// Size of a layer appended by the menu.
    pub new_layer_units: u32,
    /// Optimizer rotation used by the switch-optimizer entry.
    pub optimizers: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            factor_min: 0.5,
            factor_max: 2.0,
            tunable_params: vec!["learning_rate".into()],
            width_step: 8,
            new_layer_units: 16,
            optimizers: vec!["sgd".into(), "adam".into(), "rmsprop".into()],
        }
    }
}

// ---------------------------------------------------------------------------
// Architecture menu
// ---------------------------------------------------------------------------

/// The fixed menu walked by `architecture_adjust`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MenuEntry {
    WidenSmallest,
    AppendLayer,
    NarrowLargest,
    SwitchOptimizer,
    /// Listed for completeness; never eligible because it has no inverse.
    ReinitializeFirst,
}

impl MenuEntry {
    pub const ALL: [MenuEntry; 5] = [
        MenuEntry::WidenSmallest,
        MenuEntry::AppendLayer,
        MenuEntry::NarrowLargest,
        MenuEntry::SwitchOptimizer,
        MenuEntry::ReinitializeFirst,
    ];

    fn build(&self, config: &ModelConfig, gen: &GeneratorConfig) -> Option<(ModificationKind, Vec<Transformation>)> {
        match self {
            MenuEntry::WidenSmallest => {
                let (layer, _) = config.layers.iter().enumerate().min_by_key(|&(i, &u)| (u, i))?;
                Some((
                    ModificationKind::Architecture,
                    vec![Transformation::AddUnits { layer, count: gen.width_step }],
                ))
            }
            MenuEntry::AppendLayer => Some((
                ModificationKind::Architecture,
                vec![Transformation::InsertLayer { index: config.layers.len(), units: gen.new_layer_units }],
            )),
            MenuEntry::NarrowLargest => {
                let (layer, &units) = config
                    .layers
                    .iter()
                    .enumerate()
                    .max_by_key(|&(i, &u)| (u, std::cmp::Reverse(i)))?;
                (units > gen.width_step).then(|| {
                    (
                        ModificationKind::Architecture,
                        vec![Transformation::RemoveUnits { layer, count: gen.width_step }],
                    )
                })
            }
            MenuEntry::SwitchOptimizer => {
                let current = config.options.get("optimizer")?;
                let pos = gen.optimizers.iter().position(|o| o == current).unwrap_or(0);
                let next = gen.optimizers.get((pos + 1) % gen.optimizers.len().max(1))?;
                (next != current).then(|| {
                    (
                        ModificationKind::Strategy,
                        vec![Transformation::SetOption {
                            key: "optimizer".into(),
                            from: current.clone(),
                            to: next.clone(),
                        }],
                    )
                })
            }
            MenuEntry::ReinitializeFirst => {
                (!config.layers.is_empty()).then(|| {
                    (ModificationKind::Architecture, vec![Transformation::Reinitialize { layer: 0 }])
                })
            }
        }
    }
}

impl fmt::Display for MenuEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MenuEntry::WidenSmallest => "widen_smallest",
            MenuEntry::AppendLayer => "append_layer",
            MenuEntry::NarrowLargest => "narrow_largest",
            MenuEntry::SwitchOptimizer => "switch_optimizer",
            MenuEntry::ReinitializeFirst => "reinitialize_first",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// ModificationGenerator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ModificationGenerator {
    config: GeneratorConfig,
    next_id: AtomicU64,
    rngs: Mutex<HashMap<String, StdRng>>,
    tried: Mutex<HashMap<String, HashSet<MenuEntry>>>,
}

impl ModificationGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            rngs: Mutex::new(HashMap::new()),
            tried: Mutex::new(HashMap::new()),
        }
    }

    /// Continue id allocation after `last_id` (e.g. the highest persisted id).
    pub fn resume_ids(&self, last_id: u64) {
        self.next_id.fetch_max(last_id + 1, Ordering::SeqCst);
    }

    /// Produce one candidate for `task_id` against `current`.
    pub fn generate(&self, task_id: &str, strategy: Strategy, current: &Version, now_ms: u64) -> Result<Modification> {
        let (kind, payload) = match strategy {
            Strategy::HyperparameterTune => self.tune(task_id, &current.config)?,
            Strategy::ArchitectureAdjust => self.adjust(task_id, &current.config)?,
            Strategy::NoOp => {
                return Err(GovernorError::InvalidTransformation("no_op produces no modification".into()))
            }
        };
        let m = Modification {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            task_id: task_id.to_string(),
            kind,
            payload,
            proposed_at_ms: now_ms,
            parent_version_id: current.id,
        };
        tracing::info!(
            target: "governor::generator",
            task_id,
            modification_id = m.id,
            parent = m.parent_version_id,
            kind = %m.kind,
            change = %m.describe(),
            "candidate generated"
        );
        Ok(m)
    }

    fn tune(&self, task_id: &str, config: &ModelConfig) -> Result<(ModificationKind, Vec<Transformation>)> {
        let candidates: Vec<(&String, f64)> = self
            .config
            .tunable_params
            .iter()
            .filter_map(|p| config.params.get(p).map(|&v| (p, v)))
            .collect();
        if candidates.is_empty() {
            return Err(GovernorError::NoEligibleTransformation(format!(
                "{task_id}: no tunable parameter present"
            )));
        }

        let mut rngs = self
            .rngs
            .lock()
            .map_err(|_| GovernorError::Persistence("generator rng lock poisoned".into()))?;
        let rng = rngs
            .entry(task_id.to_string())
            .or_insert_with(|| StdRng::seed_from_u64(self.config.seed ^ fnv1a(task_id)));

        let (name, from) = candidates[rng.gen_range(0..candidates.len())];
        let lo = self.config.factor_min.ln();
        let hi = self.config.factor_max.ln();
        let mut factor = (lo + (hi - lo) * rng.gen::<f64>()).exp();
        if (factor - 1.0).abs() < 1e-9 {
            factor = self.config.factor_max;
        }
        Ok((
            ModificationKind::Hyperparameter,
            vec![Transformation::SetParam { name: name.clone(), from, to: from * factor }],
        ))
    }

    fn adjust(&self, task_id: &str, config: &ModelConfig) -> Result<(ModificationKind, Vec<Transformation>)> {
        let mut tried = self
            .tried
            .lock()
            .map_err(|_| GovernorError::Persistence("generator menu lock poisoned".into()))?;
        let tried = tried.entry(task_id.to_string()).or_default();

        for entry in MenuEntry::ALL {
            if tried.contains(&entry) {
                continue;
            }
            let Some((kind, payload)) = entry.build(config, &self.config) else { continue };
            let revertible = payload.iter().all(|t| t.inverse().is_some());
            let applies = payload.iter().try_fold(config.clone(), |c, t| t.apply(&c)).is_ok();
            if !revertible || !applies {
                continue;
            }
            tried.insert(entry);
            tracing::debug!(target: "governor::generator", task_id, %entry, "menu entry chosen");
            return Ok((kind, payload));
        }

        tracing::warn!(target: "governor::generator", task_id, "architecture menu exhausted");
        Err(GovernorError::NoEligibleTransformation(task_id.to_string()))
    }

    /// Operator reset of the tried-menu for `task_id`.
    pub fn reset(&self, task_id: &str) {
        if let Ok(mut tried) = self.tried.lock() {
            tried.remove(task_id);
        }
    }

    /// Menu entries already used for `task_id`.
    pub fn tried_entries(&self, task_id: &str) -> Vec<MenuEntry> {
        let Ok(tried) = self.tried.lock() else { return Vec::new() };
        let Some(set) = tried.get(task_id) else { return Vec::new() };
        MenuEntry::ALL.into_iter().filter(|e| set.contains(e)).collect()
    }
}

/// Stable 64-bit FNV-1a, so per-task seeds do not depend on `HashMap` randomness.
fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_tune::version::Version;

    fn root() -> Version {
        Version::root(
            0,
            "t1",
            ModelConfig::default()
                .with_param("learning_rate", 0.01)
                .with_layers(&[64, 32])
                .with_option("optimizer", "sgd"),
            0,
        )
    }

    fn gen() -> ModificationGenerator {
        ModificationGenerator::new(GeneratorConfig::default())
    }

    #[test]
    fn test_tune_factor_within_bounds() {
        let g = gen();
        let v = root();
        for _ in 0..50 {
            let m = g.generate("t1", Strategy::HyperparameterTune, &v, 0).unwrap();
            match &m.payload[..] {
                [Transformation::SetParam { name, from, to }] => {
                    assert_eq!(name, "learning_rate");
                    let f = to / from;
                    assert!((0.5 - 1e-9..=2.0 + 1e-9).contains(&f), "factor {f}");
                }
                other => panic!("unexpected payload {other:?}"),
            }
            assert_eq!(m.kind, ModificationKind::Hyperparameter);
            assert_eq!(m.parent_version_id, 0);
        }
    }

    #[test]
    fn test_tune_deterministic_given_seed() {
        let a = gen().generate("t1", Strategy::HyperparameterTune, &root(), 0).unwrap();
        let b = gen().generate("t1", Strategy::HyperparameterTune, &root(), 0).unwrap();
        assert_eq!(a.payload, b.payload);
    }

    #[test]
    fn test_different_seed_differs() {
        let a = gen().generate("t1", Strategy::HyperparameterTune, &root(), 0).unwrap();
        let b = ModificationGenerator::new(GeneratorConfig { seed: 7, ..Default::default() })
            .generate("t1", Strategy::HyperparameterTune, &root(), 0)
            .unwrap();
        assert_ne!(a.payload, b.payload);
    }

    #[test]
    fn test_ids_monotonic_and_resumable() {
        let g = gen();
        let a = g.generate("t1", Strategy::HyperparameterTune, &root(), 0).unwrap();
        g.resume_ids(100);
        let b = g.generate("t1", Strategy::HyperparameterTune, &root(), 0).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 101);
    }

    #[test]
    fn test_menu_walks_in_order_then_exhausts() {
        let g = gen();
        let v = root();
        let first = g.generate("t1", Strategy::ArchitectureAdjust, &v, 0).unwrap();
        assert_eq!(first.payload, vec![Transformation::AddUnits { layer: 1, count: 8 }]);
        let second = g.generate("t1", Strategy::ArchitectureAdjust, &v, 0).unwrap();
        assert_eq!(second.payload, vec![Transformation::InsertLayer { index: 2, units: 16 }]);
        let third = g.generate("t1", Strategy::ArchitectureAdjust, &v, 0).unwrap();
        assert_eq!(third.payload, vec![Transformation::RemoveUnits { layer: 0, count: 8 }]);
        let fourth = g.generate("t1", Strategy::ArchitectureAdjust, &v, 0).unwrap();
        assert_eq!(fourth.kind, ModificationKind::Strategy);
        assert!(matches!(
            g.generate("t1", Strategy::ArchitectureAdjust, &v, 0),
            Err(GovernorError::NoEligibleTransformation(_))
        ));
        assert_eq!(g.tried_entries("t1").len(), 4);
    }

    #[test]
    fn test_every_emitted_modification_is_revertible() {
        let g = gen();
        let v = root();
        while let Ok(m) = g.generate("t1", Strategy::ArchitectureAdjust, &v, 0) {
            assert!(m.is_revertible());
            let applied = m.apply_to(&v.config).unwrap();
            assert_eq!(m.revert_on(&applied).unwrap(), v.config);
        }
    }

    #[test]
    fn test_reset_rearms_menu() {
        let g = gen();
        let v = root();
        while g.generate("t1", Strategy::ArchitectureAdjust, &v, 0).is_ok() {}
        g.reset("t1");
        assert!(g.generate("t1", Strategy::ArchitectureAdjust, &v, 0).is_ok());
    }

    #[test]
    fn test_no_tunable_param_is_no_eligible() {
        let v = Version::root(0, "t1", ModelConfig::default().with_layers(&[4]), 0);
        assert!(matches!(
            gen().generate("t1", Strategy::HyperparameterTune, &v, 0),
            Err(GovernorError::NoEligibleTransformation(_))
        ));
    }

    #[test]
    fn test_no_op_generates_nothing() {
        assert!(gen().generate("t1", Strategy::NoOp, &root(), 0).is_err());
    }
}
