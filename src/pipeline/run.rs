// ABOUTME: The DeploymentRun aggregate and its forward-only state machine.
// ABOUTME: All run state is mutated through dedicated methods, never ambient globals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::snapshot::{Snapshot, SnapshotSet};
use crate::verify::VerificationReport;

use super::phase::{PhaseName, PhaseResult, PhaseSpec, PhaseStatus};

/// Overall state of a run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Running,
    Succeeded,
    Failed,
    RolledBack,
    ManualInterventionRequired,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded
                | RunState::Failed
                | RunState::RolledBack
                | RunState::ManualInterventionRequired
        )
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        match (self, next) {
            (RunState::Initializing, RunState::Running) => true,
            // A run can fail before its first phase starts.
            (RunState::Initializing, RunState::Failed) => true,
            (RunState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Initializing => "initializing",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::RolledBack => "rolled_back",
            RunState::ManualInterventionRequired => "manual_intervention_required",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid run state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Live,
}

impl RunMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, RunMode::DryRun)
    }
}

/// One end-to-end execution of the pipeline against a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: String,
    pub environment: String,
    pub branch: String,
    pub mode: RunMode,
    pub state: RunState,
    pub phases: Vec<PhaseResult>,
    pub snapshots: SnapshotSet,
    pub verification: Option<VerificationReport>,
    /// Set once the first mutating phase begins executing.
    pub mutated: bool,
    /// True when the run continued past a failed backup under --force.
    pub degraded: bool,
    pub warnings: Vec<String>,
    pub failed_phase: Option<PhaseName>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentRun {
    pub fn new(environment: &str, branch: &str, mode: RunMode) -> Self {
        let started_at = Utc::now();
        let id = format!(
            "{}-{}",
            started_at.format("%Y%m%d-%H%M%S"),
            environment
        );
        Self {
            id,
            environment: environment.to_string(),
            branch: branch.to_string(),
            mode,
            state: RunState::Initializing,
            phases: Vec::new(),
            snapshots: SnapshotSet::new(),
            verification: None,
            mutated: false,
            degraded: false,
            warnings: Vec::new(),
            failed_phase: None,
            started_at,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(run = %self.id, from = %self.state, to = %next, "run state transition");
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a phase entering the running state.
    pub fn phase_started(&mut self, spec: &PhaseSpec, index: usize) {
        debug_assert!(PhaseStatus::Pending.can_advance_to(PhaseStatus::Running));
        self.phases.push(PhaseResult {
            name: spec.name,
            index,
            criticality: spec.criticality,
            status: PhaseStatus::Running,
            duration_ms: 0,
            message: None,
        });
    }

    /// Finish the phase most recently started.
    pub fn phase_finished(
        &mut self,
        status: PhaseStatus,
        duration: Duration,
        message: Option<String>,
    ) {
        if let Some(phase) = self.phases.last_mut() {
            debug_assert!(phase.status.can_advance_to(status));
            phase.status = status;
            phase.duration_ms = duration.as_millis() as u64;
            phase.message = message;
            if status == PhaseStatus::Failed {
                self.failed_phase = Some(phase.name);
            }
        }
    }

    /// Record a phase skipped without running.
    pub fn phase_skipped(&mut self, spec: &PhaseSpec, index: usize, reason: &str) {
        self.phases.push(PhaseResult {
            name: spec.name,
            index,
            criticality: spec.criticality,
            status: PhaseStatus::Skipped,
            duration_ms: 0,
            message: Some(reason.to_string()),
        });
    }

    pub fn record_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshots.record(snapshot);
    }

    /// Mark the first target mutation. Irreversible for the run's lifetime.
    pub fn mark_mutated(&mut self) {
        self.mutated = true;
    }

    pub fn mark_degraded(&mut self, reason: impl Into<String>) {
        self.degraded = true;
        self.push_warning(reason);
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(run = %self.id, "{warning}");
        self.warnings.push(warning);
    }

    pub fn has_blocking_failure(&self) -> bool {
        self.phases.iter().any(|p| {
            p.status == PhaseStatus::Failed
                && p.criticality == super::phase::Criticality::Blocking
        })
    }

    pub fn phase_counts(&self) -> (usize, usize, usize) {
        let mut ok = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for phase in &self.phases {
            match phase.status {
                PhaseStatus::Success => ok += 1,
                PhaseStatus::Failed => failed += 1,
                PhaseStatus::Skipped => skipped += 1,
                _ => {}
            }
        }
        (ok, failed, skipped)
    }

    pub fn duration(&self) -> Option<chrono::TimeDelta> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_states() -> Vec<RunState> {
        vec![
            RunState::Initializing,
            RunState::Running,
            RunState::Succeeded,
            RunState::Failed,
            RunState::RolledBack,
            RunState::ManualInterventionRequired,
        ]
    }

    #[test]
    fn happy_path_transitions() {
        let mut run = DeploymentRun::new("production", "main", RunMode::Live);
        assert_eq!(run.state, RunState::Initializing);
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Succeeded).unwrap();
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut run = DeploymentRun::new("production", "main", RunMode::Live);
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::RolledBack).unwrap();
        assert!(run.transition(RunState::Succeeded).is_err());
        assert!(run.transition(RunState::Running).is_err());
    }

    #[test]
    fn cannot_succeed_straight_from_initializing() {
        let mut run = DeploymentRun::new("production", "main", RunMode::Live);
        assert!(run.transition(RunState::Succeeded).is_err());
        // But a pre-phase failure is a legal terminal outcome.
        run.transition(RunState::Failed).unwrap();
    }

    #[test]
    fn run_id_embeds_environment() {
        let run = DeploymentRun::new("staging", "main", RunMode::DryRun);
        assert!(run.id.ends_with("-staging"));
    }

    #[test]
    fn blocking_failure_is_detected() {
        let specs = super::super::phase::standard_phases();
        let mut run = DeploymentRun::new("production", "main", RunMode::Live);
        run.transition(RunState::Running).unwrap();

        run.phase_started(&specs[0], 0);
        run.phase_finished(PhaseStatus::Success, Duration::from_millis(10), None);
        assert!(!run.has_blocking_failure());

        run.phase_started(&specs[4], 4);
        run.phase_finished(
            PhaseStatus::Failed,
            Duration::from_millis(10),
            Some("migration exited 1".into()),
        );
        assert!(run.has_blocking_failure());
        assert_eq!(run.failed_phase, Some(PhaseName::Migrate));
        assert_eq!(run.phase_counts(), (1, 1, 0));
    }

    proptest! {
        /// No sequence of transitions can move a run out of a terminal state.
        #[test]
        fn terminal_states_are_absorbing(attempts in proptest::collection::vec(0usize..6, 1..8)) {
            let states = all_states();
            for terminal in states.iter().filter(|s| s.is_terminal()) {
                for &idx in &attempts {
                    prop_assert!(!terminal.can_transition_to(states[idx]));
                }
            }
        }

        /// Succeeded is only reachable from Running.
        #[test]
        fn succeeded_only_from_running(from_idx in 0usize..6) {
            let states = all_states();
            let from = states[from_idx];
            if from.can_transition_to(RunState::Succeeded) {
                prop_assert_eq!(from, RunState::Running);
            }
        }
    }
}
