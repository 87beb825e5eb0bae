//! Crate-level error taxonomy.
//!
//! Every fallible operation in the governor returns [`GovernorError`].  The
//! recoverable cycle outcomes (`ValidationRejected`, `InconclusiveShadow`,
//! `NoEligibleTransformation`, `StaleParent`) are ordinary variants so the
//! control loop can match on them and record the verdict instead of
//! propagating.

use thiserror::Error;

/// Errors produced by the governance loop and its collaborators.
#[derive(Error, Debug)]
pub enum GovernorError {
    /// A candidate violated at least one configured constraint.
    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    /// The shadow test collected fewer paired samples than required.
    #[error("shadow test inconclusive: {samples} of {required} samples")]
    InconclusiveShadow { samples: usize, required: usize },

    /// The architecture menu has no untried reversible transformation left.
    #[error("no eligible transformation for task {0}")]
    NoEligibleTransformation(String),

    /// The modification was generated against a version that is no longer active.
    #[error("stale parent: modification built on v{expected}, active is v{actual}")]
    StaleParent { expected: u64, actual: u64 },

    /// The requested version id is not retained.
    #[error("unknown version: v{0}")]
    UnknownVersion(u64),

    /// The requested revert target is not on the active version's lineage.
    #[error("v{target} is not an ancestor of active v{active}")]
    NotAnAncestor { target: u64, active: u64 },

    /// No task with this id has been registered.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// The observation id was never recorded for this task, or has been pruned.
    #[error("observation {id} not retained for task {task_id}")]
    UnknownObservation { task_id: String, id: u64 },

    /// Ground truth was already attached to this observation.
    #[error("observation {0} already resolved")]
    AlreadyResolved(u64),

    /// A cycle is already running for this task.
    #[error("cycle already in flight for task {0}")]
    CycleInFlight(String),

    /// Administrative operation refused while cycles are running.
    #[error("{0} cycle(s) in flight; retry between cycles")]
    CyclesInFlight(usize),

    /// A transformation could not be applied to a configuration.
    #[error("invalid transformation: {0}")]
    InvalidTransformation(String),

    /// The model capability reported a failure.
    #[error("model error: {0}")]
    Model(String),

    /// The version store could not read or write.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration could not be parsed or is out of range.
    #[error("config error: {0}")]
    Config(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernorError {
    /// Whether the error ends a cycle as an ordinary rejection rather than a fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GovernorError::ValidationRejected(_)
                | GovernorError::InconclusiveShadow { .. }
                | GovernorError::NoEligibleTransformation(_)
                | GovernorError::StaleParent { .. }
        )
    }
}

/// Shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, GovernorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_stale_parent() {
        let e = GovernorError::StaleParent { expected: 1, actual: 2 };
        assert_eq!(e.to_string(), "stale parent: modification built on v1, active is v2");
    }

    #[test]
    fn test_display_validation_rejected() {
        let e = GovernorError::ValidationRejected("max_deviation exceeded".into());
        assert!(e.to_string().contains("max_deviation exceeded"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(GovernorError::NoEligibleTransformation("t1".into()).is_recoverable());
        assert!(GovernorError::InconclusiveShadow { samples: 3, required: 30 }.is_recoverable());
        assert!(!GovernorError::UnknownVersion(9).is_recoverable());
        assert!(!GovernorError::Persistence("disk".into()).is_recoverable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let e: GovernorError = err.into();
        assert!(matches!(e, GovernorError::Json(_)));
    }
}
