//! Runtime configuration.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration.  `validate` rejects combinations the loop cannot run with.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GovernorError, Result};
use crate::self_modify::generator::GeneratorConfig;
use crate::self_tune::feedback::FeedbackConfig;
use crate::self_tune::metric_store::MetricsConfig;
use crate::self_tune::shadow::ShadowConfig;
use crate::self_tune::strategy::StrategyConfig;

/// Knobs of the cycle driver itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Extra shadow runs after an `Inconclusive` result before the cycle is discarded.
    pub max_shadow_retries: u32,
    /// Regenerations allowed after a `StaleParent` commit failure.
    pub max_stale_restarts: u32,
    /// Resolved observations per task between periodic snapshot captures.
    pub capture_every: u64,
    /// Observations summarised by each captured snapshot.
    pub snapshot_window: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self { max_shadow_retries: 2, max_stale_restarts: 1, capture_every: 50, snapshot_window: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GovernorConfig {
    pub metrics: MetricsConfig,
    pub feedback: FeedbackConfig,
    pub strategy: StrategyConfig,
    pub generator: GeneratorConfig,
    pub shadow: ShadowConfig,
    pub cycle: CycleConfig,
}

impl GovernorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(GovernorError::Config(msg.to_string()));

        if self.feedback.window_size == 0 {
            return fail("feedback.window_size must be at least 1");
        }
        if !(self.feedback.degradation_threshold > 0.0) {
            return fail("feedback.degradation_threshold must be positive");
        }
        if self.feedback.count_budget == Some(0) {
            return fail("feedback.count_budget must be positive when set");
        }
        if self.metrics.snapshot_retention == 0 {
            return fail("metrics.snapshot_retention must be at least 1");
        }
        if self.strategy.trend_len < 2 {
            return fail("strategy.trend_len must be at least 2");
        }
        let g = &self.generator;
        if !(g.factor_min > 0.0 && g.factor_min <= g.factor_max) {
            return fail("generator factor range must satisfy 0 < factor_min <= factor_max");
        }
        if g.tunable_params.is_empty() {
            return fail("generator.tunable_params must name at least one parameter");
        }
        if g.width_step == 0 || g.new_layer_units == 0 {
            return fail("generator.width_step and generator.new_layer_units must be positive");
        }
        let s = &self.shadow;
        if s.min_samples == 0 || s.max_samples < s.min_samples {
            return fail("shadow sample bounds must satisfy 0 < min_samples <= max_samples");
        }
        if s.deadline_ms == 0 {
            return fail("shadow.deadline_ms must be positive");
        }
        if !(s.significance > 0.0 && s.significance < 1.0) {
            return fail("shadow.significance must lie in (0, 1)");
        }
        if self.cycle.capture_every == 0 || self.cycle.snapshot_window == 0 {
            return fail("cycle.capture_every and cycle.snapshot_window must be positive");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let c = GovernorConfig::from_toml_str("").unwrap();
        assert_eq!(c, GovernorConfig::default());
        assert_eq!(c.feedback.window_size, 50);
        assert_eq!(c.shadow.min_samples, 30);
        assert_eq!(c.cycle.max_shadow_retries, 2);
        assert_eq!(c.cycle.max_stale_restarts, 1);
    }

    #[test]
    fn test_partial_section_overrides() {
        let c = GovernorConfig::from_toml_str(
            r#"
            [feedback]
            window_size = 20

            [generator]
            seed = 7
            tunable_params = ["learning_rate", "dropout"]
            "#,
        )
        .unwrap();
        assert_eq!(c.feedback.window_size, 20);
        assert!((c.feedback.degradation_threshold - 0.3).abs() < 1e-12);
        assert_eq!(c.generator.seed, 7);
        assert_eq!(c.generator.tunable_params.len(), 2);
    }

    #[test]
    fn test_inverted_factor_range_rejected() {
        let err = GovernorConfig::from_toml_str("[generator]\nfactor_min = 3.0\nfactor_max = 2.0\n").unwrap_err();
        assert!(matches!(err, GovernorError::Config(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut c = GovernorConfig::default();
        c.feedback.window_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_toml_error() {
        assert!(matches!(GovernorConfig::from_toml_str("[feedback"), Err(GovernorError::Toml(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor.toml");
        std::fs::write(&path, "[shadow]\nmin_samples = 10\n").unwrap();
        assert_eq!(GovernorConfig::from_file(&path).unwrap().shadow.min_samples, 10);
    }
}
