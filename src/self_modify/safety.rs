//! # Stage: Safety Validator
//!
//! ## Responsibility
//! Static gate every candidate passes before any execution resource is spent
//! on it.  Checks, in order:
//!
//! 1. Revertible: every transformation has an inverse
//! 2. Applicable: the payload applies cleanly to the parent configuration
//! 3. Each configured constraint:
//!    - `bounded_range`: a (pseudo-)parameter of the result lies in `[min, max]`
//!    - `max_deviation`: summed relative change from the parent ≤ `limit`
//!    - `forbidden_combination`: not every predicate holds on the result
//!
//! ## Guarantees
//! - Pure: no I/O and no state; the same inputs always give the same verdict
//! - All-or-nothing: one violation rejects the whole candidate
//! - Monotone: adding constraints can only turn a pass into a reject
//!
//! ## NOT Responsible For
//! - Measuring whether the candidate is better (that is the shadow tester)
//! - Loading or hot-reloading constraints (the control loop owns the set)

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::ModelConfig;
use crate::self_modify::transform::Modification;

// ---------------------------------------------------------------------------
// Constraint model
// ---------------------------------------------------------------------------

/// A condition on a resulting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Predicate {
    OptionEquals { key: String, value: String },
    ParamAbove { param: String, value: f64 },
    ParamBelow { param: String, value: f64 },
}

impl Predicate {
    pub fn holds(&self, config: &ModelConfig) -> bool {
        match self {
            Predicate::OptionEquals { key, value } => config.options.get(key) == Some(value),
            Predicate::ParamAbove { param, value } => config.numeric(param).is_some_and(|v| v > *value),
            Predicate::ParamBelow { param, value } => config.numeric(param).is_some_and(|v| v < *value),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::OptionEquals { key, value } => write!(f, "{key} == {value}"),
            Predicate::ParamAbove { param, value } => write!(f, "{param} > {value}"),
            Predicate::ParamBelow { param, value } => write!(f, "{param} < {value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Upper bound on the summed relative change of numeric parameters and total units.
    MaxDeviation { limit: f64 },
    /// `param` (or `arch.layers` / `arch.units.total`) must stay in `[min, max]`.
    BoundedRange { param: String, min: f64, max: f64 },
    /// The result must not satisfy all of `predicates` at once.
    ForbiddenCombination { predicates: Vec<Predicate> },
}

/// One named, configured rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    #[serde(flatten)]
    pub kind: ConstraintKind,
}

/// The versioned, process-wide constraint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConstraintSet {
    pub version: u64,
    pub constraints: Vec<Constraint>,
}

impl ConstraintSet {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Reject(String),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Reject(reason) => write!(f, "REJECT: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Summed relative change from `before` to `after`.
///
/// Each numeric parameter contributes `|to - from| / |from|` (or `|to|` when
/// `from` is zero); the total unit count contributes the same way.
pub fn deviation(before: &ModelConfig, after: &ModelConfig) -> f64 {
    let rel = |from: f64, to: f64| {
        if from == 0.0 { (to - from).abs() } else { (to - from).abs() / from.abs() }
    };
    let mut total = 0.0;
    for (name, &to) in &after.params {
        total += rel(before.params.get(name).copied().unwrap_or(0.0), to);
    }
    for (name, &from) in &before.params {
        if !after.params.contains_key(name) {
            total += rel(from, 0.0);
        }
    }
    total + rel(before.total_units() as f64, after.total_units() as f64)
}

/// Stateless validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyValidator;

impl SafetyValidator {
    /// Validate `modification` against `constraints`, relative to the parent
    /// configuration it was generated from.
    pub fn validate(&self, modification: &Modification, constraints: &ConstraintSet, parent: &ModelConfig) -> Verdict {
        if !modification.is_revertible() {
            return Verdict::Reject("not revertible".into());
        }
        let result = match modification.apply_to(parent) {
            Ok(c) => c,
            Err(e) => return Verdict::Reject(format!("inapplicable: {e}")),
        };
        for c in &constraints.constraints {
            if let Some(reason) = Self::violation(c, parent, &result) {
                return Verdict::Reject(reason);
            }
        }
        Verdict::Pass
    }

    fn violation(c: &Constraint, parent: &ModelConfig, result: &ModelConfig) -> Option<String> {
        match &c.kind {
            ConstraintKind::MaxDeviation { limit } => {
                let dev = deviation(parent, result);
                (dev > *limit).then(|| {
                    tracing::debug!(target: "governor::safety", constraint = %c.name, dev, limit, "deviation too large");
                    "max_deviation exceeded".to_string()
                })
            }
            ConstraintKind::BoundedRange { param, min, max } => {
                let v = result.numeric(param)?;
                (v < *min || v > *max)
                    .then(|| format!("bounded_range {}: {param}={v} outside [{min}, {max}]", c.name))
            }
            ConstraintKind::ForbiddenCombination { predicates } => {
                (!predicates.is_empty() && predicates.iter().all(|p| p.holds(result)))
                    .then(|| format!("forbidden_combination {}", c.name))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
