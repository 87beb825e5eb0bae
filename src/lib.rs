//! # adaptive-governor
//!
//! A runtime governance loop around a trainable model.  The model proposes
//! data-described modifications to its own configuration; each one is gated
//! by a safety validator and a paired shadow test before it may become the
//! active version, and every committed version can be reverted.
//!
//! ```text
//! Observation ──► MetricStore ──► FeedbackAggregator ──► StrategySelector
//!                                                             │
//!   VersionManager ◄── ShadowTester ◄── SafetyValidator ◄── ModificationGenerator
//! ```
//!
//! [`control::ControlLoop`] owns the stages and drives each triggered cycle;
//! [`self_modify::store::VersionStore`] persists versions and the cycle audit log.

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod model;
pub mod self_modify;
pub mod self_tune;

pub use config::{CycleConfig, GovernorConfig};
pub use control::{ControlLoop, CycleOutcome, CycleRecord, CycleState, PerformanceSummary};
pub use error::{GovernorError, Result};
pub use model::{ModelConfig, SimulatedModel, TaskKind, TrainableModel};
pub use self_modify::safety::{Constraint, ConstraintKind, ConstraintSet, Verdict};
pub use self_modify::store::{MemoryStore, SqliteStore, VersionStore};
pub use self_modify::transform::{Modification, ModificationKind, Transformation};
pub use self_tune::metric_store::{MetricSnapshot, Observation, Window};
pub use self_tune::shadow::{ShadowVerdict, TrafficSample, TrafficSource};
pub use self_tune::version::{Version, VersionState};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
