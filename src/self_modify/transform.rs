//! # Stage: Reversible Transformations
//!
//! ## Responsibility
//! The closed set of configuration edits a modification may carry.  Each
//! [`Transformation`] is plain data with an explicit `apply` and, where one
//! exists, an explicit `inverse`.  A [`Modification`] is an ordered list of
//! transformations plus the lineage metadata the version manager needs.
//!
//! ## Guarantees
//! - Closed: no code generation, only the variants below
//! - Checked: every transformation verifies the value it expects to replace,
//!   so applying against the wrong base fails instead of corrupting it
//! - Round trip: `inverse(apply(c)) == c` bit-for-bit for every transformation
//!   that has an inverse
//!
//! ## NOT Responsible For
//! - Choosing transformations (that is the generator)
//! - Deciding whether a transformation is safe (that is the safety validator)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};
use crate::model::ModelConfig;

// ---------------------------------------------------------------------------
// Transformation
// ---------------------------------------------------------------------------

/// One primitive configuration edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transformation {
    /// Replace a numeric hyperparameter.
    SetParam { name: String, from: f64, to: f64 },
    /// Widen a hidden layer.
    AddUnits { layer: usize, count: u32 },
    /// Narrow a hidden layer; never to zero.
    RemoveUnits { layer: usize, count: u32 },
    /// Insert a hidden layer of `units` at `index`.
    InsertLayer { index: usize, units: u32 },
    /// Remove the hidden layer at `index`, which must have `units` units.
    RemoveLayer { index: usize, units: u32 },
    /// Switch a categorical option.
    SetOption { key: String, from: String, to: String },
    /// Re-draw the weights of a layer.  Has no inverse.
    Reinitialize { layer: usize },
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transformation::SetParam { name, from, to } => write!(f, "set {name}: {from} -> {to}"),
            Transformation::AddUnits { layer, count } => write!(f, "layer[{layer}] +{count} units"),
            Transformation::RemoveUnits { layer, count } => write!(f, "layer[{layer}] -{count} units"),
            Transformation::InsertLayer { index, units } => write!(f, "insert layer[{index}] ({units} units)"),
            Transformation::RemoveLayer { index, units } => write!(f, "remove layer[{index}] ({units} units)"),
            Transformation::SetOption { key, from, to } => write!(f, "option {key}: {from} -> {to}"),
            Transformation::Reinitialize { layer } => write!(f, "reinitialize layer[{layer}]"),
        }
    }
}

impl Transformation {
    /// Apply to `config`, returning the new configuration.
    pub fn apply(&self, config: &ModelConfig) -> Result<ModelConfig> {
        let mut next = config.clone();
        match self {
            Transformation::SetParam { name, from, to } => {
                let current = config
                    .params
                    .get(name)
                    .copied()
                    .ok_or_else(|| invalid(format!("unknown param {name}")))?;
                if current.to_bits() != from.to_bits() {
                    return Err(invalid(format!("{name} is {current}, expected {from}")));
                }
                next.params.insert(name.clone(), *to);
            }
            Transformation::AddUnits { layer, count } => {
                let units = next
                    .layers
                    .get_mut(*layer)
                    .ok_or_else(|| invalid(format!("no layer {layer}")))?;
                *units = units
                    .checked_add(*count)
                    .ok_or_else(|| invalid(format!("layer {layer} overflows")))?;
            }
            Transformation::RemoveUnits { layer, count } => {
                let units = next
                    .layers
                    .get_mut(*layer)
                    .ok_or_else(|| invalid(format!("no layer {layer}")))?;
                if *units <= *count {
                    return Err(invalid(format!("layer {layer} has only {units} units")));
                }
                *units -= count;
            }
            Transformation::InsertLayer { index, units } => {
                if *index > next.layers.len() || *units == 0 {
                    return Err(invalid(format!("cannot insert {units} units at {index}")));
                }
                next.layers.insert(*index, *units);
            }
            Transformation::RemoveLayer { index, units } => {
                match next.layers.get(*index) {
                    Some(u) if u == units => {}
                    Some(u) => return Err(invalid(format!("layer {index} has {u} units, expected {units}"))),
                    None => return Err(invalid(format!("no layer {index}"))),
                }
                if next.layers.len() == 1 {
                    return Err(invalid("cannot remove the last layer".into()));
                }
                next.layers.remove(*index);
            }
            Transformation::SetOption { key, from, to } => {
                match config.options.get(key) {
                    Some(current) if current == from => {}
                    Some(current) => return Err(invalid(format!("{key} is {current}, expected {from}"))),
                    None => return Err(invalid(format!("unknown option {key}"))),
                }
                next.options.insert(key.clone(), to.clone());
            }
            Transformation::Reinitialize { layer } => {
                if *layer >= next.layers.len() {
                    return Err(invalid(format!("no layer {layer}")));
                }
            }
        }
        Ok(next)
    }

    /// The transformation that undoes this one, or `None` if it cannot be undone.
    pub fn inverse(&self) -> Option<Transformation> {
        Some(match self {
            Transformation::SetParam { name, from, to } => Transformation::SetParam {
                name: name.clone(),
                from: *to,
                to: *from,
            },
            Transformation::AddUnits { layer, count } => Transformation::RemoveUnits { layer: *layer, count: *count },
            Transformation::RemoveUnits { layer, count } => Transformation::AddUnits { layer: *layer, count: *count },
            Transformation::InsertLayer { index, units } => Transformation::RemoveLayer { index: *index, units: *units },
            Transformation::RemoveLayer { index, units } => Transformation::InsertLayer { index: *index, units: *units },
            Transformation::SetOption { key, from, to } => Transformation::SetOption {
                key: key.clone(),
                from: to.clone(),
                to: from.clone(),
            },
            Transformation::Reinitialize { .. } => return None,
        })
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Transformation::AddUnits { .. }
                | Transformation::RemoveUnits { .. }
                | Transformation::InsertLayer { .. }
                | Transformation::RemoveLayer { .. }
                | Transformation::Reinitialize { .. }
        )
    }
}

fn invalid(msg: String) -> GovernorError {
    GovernorError::InvalidTransformation(msg)
}

// ---------------------------------------------------------------------------
// Modification
// ---------------------------------------------------------------------------

/// Category of a modification, used for reporting and ladder bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Hyperparameter,
    Architecture,
    Strategy,
}

impl fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModificationKind::Hyperparameter => write!(f, "hyperparameter"),
            ModificationKind::Architecture => write!(f, "architecture"),
            ModificationKind::Strategy => write!(f, "strategy"),
        }
    }
}

/// An immutable, data-described candidate change to one task's model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    /// Monotonic across the process.
    pub id: u64,
    pub task_id: String,
    pub kind: ModificationKind,
    /// Applied in order.
    pub payload: Vec<Transformation>,
    pub proposed_at_ms: u64,
    /// Version that was active when this modification was generated.
    pub parent_version_id: u64,
}

impl Modification {
    /// Apply every transformation in order.
    pub fn apply_to(&self, config: &ModelConfig) -> Result<ModelConfig> {
        self.payload.iter().try_fold(config.clone(), |c, t| t.apply(&c))
    }

    /// The payload that undoes this modification, or `None` if any step lacks an inverse.
    pub fn inverse_payload(&self) -> Option<Vec<Transformation>> {
        self.payload.iter().rev().map(Transformation::inverse).collect()
    }

    pub fn is_revertible(&self) -> bool {
        self.payload.iter().all(|t| t.inverse().is_some())
    }

    /// Undo this modification on `config` (the configuration it produced).
    pub fn revert_on(&self, config: &ModelConfig) -> Result<ModelConfig> {
        let inverse = self
            .inverse_payload()
            .ok_or_else(|| invalid(format!("modification {} has no inverse", self.id)))?;
        inverse.iter().try_fold(config.clone(), |c, t| t.apply(&c))
    }

    pub fn describe(&self) -> String {
        self.payload.iter().map(|t| t.to_string()).collect::<Vec<_>>().join("; ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn base() -> ModelConfig {
        ModelConfig::default()
            .with_param("learning_rate", 0.01)
            .with_param("dropout", 0.2)
            .with_layers(&[64, 32])
            .with_option("optimizer", "sgd")
    }

    #[rstest]
    #[case(Transformation::SetParam { name: "learning_rate".into(), from: 0.01, to: 0.013 })]
    #[case(Transformation::AddUnits { layer: 1, count: 8 })]
    #[case(Transformation::RemoveUnits { layer: 0, count: 16 })]
    #[case(Transformation::InsertLayer { index: 2, units: 16 })]
    #[case(Transformation::RemoveLayer { index: 1, units: 32 })]
    #[case(Transformation::SetOption { key: "optimizer".into(), from: "sgd".into(), to: "adam".into() })]
    fn test_inverse_restores_config(#[case] t: Transformation) {
        let c = base();
        let applied = t.apply(&c).unwrap();
        assert_ne!(applied, c);
        let back = t.inverse().unwrap().apply(&applied).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_reinitialize_has_no_inverse() {
        assert!(Transformation::Reinitialize { layer: 0 }.inverse().is_none());
    }

    #[test]
    fn test_set_param_checks_expected_value() {
        let t = Transformation::SetParam { name: "learning_rate".into(), from: 0.5, to: 0.1 };
        assert!(matches!(t.apply(&base()), Err(GovernorError::InvalidTransformation(_))));
    }

    #[test]
    fn test_remove_units_never_empties_layer() {
        let t = Transformation::RemoveUnits { layer: 1, count: 32 };
        assert!(t.apply(&base()).is_err());
    }

    #[test]
    fn test_remove_last_layer_rejected() {
        let c = ModelConfig::default().with_layers(&[8]);
        let t = Transformation::RemoveLayer { index: 0, units: 8 };
        assert!(t.apply(&c).is_err());
    }

    #[test]
    fn test_modification_revert_on_multi_step() {
        let m = Modification {
            id: 3,
            task_id: "t1".into(),
            kind: ModificationKind::Architecture,
            payload: vec![
                Transformation::InsertLayer { index: 0, units: 128 },
                Transformation::AddUnits { layer: 2, count: 4 },
            ],
            proposed_at_ms: 0,
            parent_version_id: 0,
        };
        let applied = m.apply_to(&base()).unwrap();
        assert_eq!(applied.layers, vec![128, 64, 36]);
        assert_eq!(m.revert_on(&applied).unwrap(), base());
    }

    #[test]
    fn test_non_revertible_modification_detected() {
        let m = Modification {
            id: 1,
            task_id: "t1".into(),
            kind: ModificationKind::Architecture,
            payload: vec![Transformation::Reinitialize { layer: 0 }],
            proposed_at_ms: 0,
            parent_version_id: 0,
        };
        assert!(!m.is_revertible());
        assert!(m.revert_on(&base()).is_err());
    }

    #[test]
    fn test_transformation_serde_tagged() {
        let t = Transformation::AddUnits { layer: 0, count: 4 };
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"op\":\"add_units\""));
    }

    proptest! {
        #[test]
        fn prop_set_param_round_trip_is_bit_exact(factor in 0.5f64..2.0) {
            let c = base();
            let t = Transformation::SetParam { name: "learning_rate".into(), from: 0.01, to: 0.01 * factor };
            let back = t.inverse().unwrap().apply(&t.apply(&c).unwrap()).unwrap();
            prop_assert_eq!(back.params["learning_rate"].to_bits(), 0.01f64.to_bits());
        }
    }
}
