// ABOUTME: Phase descriptors for the deployment pipeline.
// ABOUTME: The phase order is data; the engine interprets descriptors generically.

use serde::{Deserialize, Serialize};

use crate::snapshot::SnapshotKind;

/// One ordered step of the deployment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Precheck,
    Backup,
    Sync,
    Build,
    Migrate,
    Restart,
    Verify,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Precheck => "precheck",
            PhaseName::Backup => "backup",
            PhaseName::Sync => "sync",
            PhaseName::Build => "build",
            PhaseName::Migrate => "migrate",
            PhaseName::Restart => "restart",
            PhaseName::Verify => "verify",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "precheck" => Ok(PhaseName::Precheck),
            "backup" => Ok(PhaseName::Backup),
            "sync" => Ok(PhaseName::Sync),
            "build" => Ok(PhaseName::Build),
            "migrate" => Ok(PhaseName::Migrate),
            "restart" => Ok(PhaseName::Restart),
            "verify" => Ok(PhaseName::Verify),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Whether a phase's failure aborts the run or is logged and skipped over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Blocking,
    Warning,
}

/// Conditions under which a phase is skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCondition {
    /// Skipped when the operator passes `--skip <phase>`.
    Flag,
    /// Skipped when the config provides nothing for this phase to run.
    Unconfigured,
}

/// Descriptor for one phase: what it is, how failure is graded, what
/// snapshot kind must exist before it runs, and when it may be skipped.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSpec {
    pub name: PhaseName,
    pub criticality: Criticality,
    /// The snapshot kind protecting this phase. A phase with a kind here
    /// mutates the target and must be preceded by that snapshot.
    pub snapshot: Option<SnapshotKind>,
    pub skip: &'static [SkipCondition],
}

impl PhaseSpec {
    pub fn is_mutating(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn skippable_by_flag(&self) -> bool {
        self.skip.contains(&SkipCondition::Flag)
    }

    pub fn skippable_when_unconfigured(&self) -> bool {
        self.skip.contains(&SkipCondition::Unconfigured)
    }
}

/// The fixed phase order. Adding or reordering phases is a data change.
pub fn standard_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec {
            name: PhaseName::Precheck,
            criticality: Criticality::Blocking,
            snapshot: None,
            skip: &[],
        },
        PhaseSpec {
            name: PhaseName::Backup,
            criticality: Criticality::Blocking,
            snapshot: None,
            skip: &[SkipCondition::Unconfigured],
        },
        PhaseSpec {
            name: PhaseName::Sync,
            criticality: Criticality::Blocking,
            snapshot: Some(SnapshotKind::Code),
            skip: &[SkipCondition::Flag, SkipCondition::Unconfigured],
        },
        PhaseSpec {
            name: PhaseName::Build,
            criticality: Criticality::Blocking,
            snapshot: Some(SnapshotKind::Config),
            skip: &[SkipCondition::Flag, SkipCondition::Unconfigured],
        },
        PhaseSpec {
            name: PhaseName::Migrate,
            criticality: Criticality::Blocking,
            snapshot: Some(SnapshotKind::Database),
            skip: &[SkipCondition::Flag, SkipCondition::Unconfigured],
        },
        PhaseSpec {
            name: PhaseName::Restart,
            criticality: Criticality::Blocking,
            snapshot: None,
            skip: &[SkipCondition::Flag],
        },
        PhaseSpec {
            name: PhaseName::Verify,
            criticality: Criticality::Blocking,
            snapshot: None,
            skip: &[SkipCondition::Flag, SkipCondition::Unconfigured],
        },
    ]
}

/// Status of one phase within a run. Only advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Valid forward transitions: pending -> running -> {success|failed},
    /// pending -> skipped.
    pub fn can_advance_to(&self, next: PhaseStatus) -> bool {
        matches!(
            (self, next),
            (PhaseStatus::Pending, PhaseStatus::Running)
                | (PhaseStatus::Pending, PhaseStatus::Skipped)
                | (PhaseStatus::Running, PhaseStatus::Success)
                | (PhaseStatus::Running, PhaseStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Success | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }
}

/// Recorded outcome of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: PhaseName,
    pub index: usize,
    pub criticality: Criticality,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order_is_fixed() {
        let names: Vec<_> = standard_phases().iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                PhaseName::Precheck,
                PhaseName::Backup,
                PhaseName::Sync,
                PhaseName::Build,
                PhaseName::Migrate,
                PhaseName::Restart,
                PhaseName::Verify,
            ]
        );
    }

    #[test]
    fn mutating_phases_each_declare_a_snapshot_kind() {
        let mutating: Vec<_> = standard_phases()
            .into_iter()
            .filter(PhaseSpec::is_mutating)
            .collect();
        assert_eq!(mutating.len(), 3);
        for spec in mutating {
            assert_eq!(spec.snapshot.unwrap().protected_phase(), spec.name);
        }
    }

    #[test]
    fn status_only_advances_forward() {
        assert!(PhaseStatus::Pending.can_advance_to(PhaseStatus::Running));
        assert!(PhaseStatus::Pending.can_advance_to(PhaseStatus::Skipped));
        assert!(PhaseStatus::Running.can_advance_to(PhaseStatus::Failed));

        assert!(!PhaseStatus::Success.can_advance_to(PhaseStatus::Running));
        assert!(!PhaseStatus::Failed.can_advance_to(PhaseStatus::Success));
        assert!(!PhaseStatus::Skipped.can_advance_to(PhaseStatus::Running));
        assert!(!PhaseStatus::Running.can_advance_to(PhaseStatus::Pending));
    }

    #[test]
    fn phase_names_parse_from_cli_strings() {
        assert_eq!("migrate".parse::<PhaseName>().unwrap(), PhaseName::Migrate);
        assert_eq!("VERIFY".parse::<PhaseName>().unwrap(), PhaseName::Verify);
        assert!("frontend".parse::<PhaseName>().is_err());
    }
}
