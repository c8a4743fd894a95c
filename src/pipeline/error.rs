// ABOUTME: Phase-level error types and the single failure classifier.
// ABOUTME: Maps every phase failure to continue, abort, or rollback.

use crate::pipeline::phase::{Criticality, PhaseName};
use crate::services::ServiceError;
use crate::snapshot::{BackupError, SnapshotKind};
use crate::verify::Verdict;

/// A phase failed while executing.
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("migration failed: {0}")]
    Migration(ServiceError),

    #[error("verification reported {verdict:?}")]
    Verification { verdict: Verdict },

    #[error("required {kind} snapshot missing before {phase}")]
    MissingSnapshot {
        kind: SnapshotKind,
        phase: PhaseName,
    },

    #[error("service {name} not running after restart")]
    ServiceNotRunning { name: String },

    #[error("aborted by signal or external timeout")]
    Aborted,
}

/// What the engine does about a failed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Log, mark the phase failed, move on.
    Continue,
    /// Stop the run. Nothing was mutated, so there is nothing to restore.
    Abort,
    /// Stop the run and hand off to the rollback controller.
    Rollback,
}

/// The one place failures are classified.
///
/// Warning-criticality failures never stop the run. Blocking failures abort
/// when the target is still untouched and roll back once it is not.
pub fn classify(criticality: Criticality, mutated: bool) -> FailureAction {
    match criticality {
        Criticality::Warning => FailureAction::Continue,
        Criticality::Blocking if mutated => FailureAction::Rollback,
        Criticality::Blocking => FailureAction::Abort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_failures_continue_regardless_of_mutation() {
        assert_eq!(classify(Criticality::Warning, false), FailureAction::Continue);
        assert_eq!(classify(Criticality::Warning, true), FailureAction::Continue);
    }

    #[test]
    fn blocking_failure_before_mutation_aborts() {
        assert_eq!(classify(Criticality::Blocking, false), FailureAction::Abort);
    }

    #[test]
    fn blocking_failure_after_mutation_rolls_back() {
        assert_eq!(classify(Criticality::Blocking, true), FailureAction::Rollback);
    }
}
