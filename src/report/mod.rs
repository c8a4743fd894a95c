// ABOUTME: Incident reporter and append-only run logs.
// ABOUTME: Persists one JSONL log per run and one incident record per failed run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::pipeline::{DeploymentRun, PhaseName, PhaseStatus, RunState};

/// How a failed run was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    RolledBack,
    ManualInterventionRequired,
}

/// Audit artifact persisted for every failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub run_id: String,
    pub environment: String,
    pub failed_phase: Option<PhaseName>,
    /// Snapshot ids restored during rollback, in restore order.
    pub restored_snapshots: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resolution: Resolution,
}

impl IncidentRecord {
    pub fn from_run(run: &DeploymentRun, restored_snapshots: Vec<String>) -> Self {
        let resolution = match run.state {
            RunState::ManualInterventionRequired => Resolution::ManualInterventionRequired,
            _ => Resolution::RolledBack,
        };
        Self {
            id: format!("incident-{}", run.id),
            run_id: run.id.clone(),
            environment: run.environment.clone(),
            failed_phase: run.failed_phase,
            restored_snapshots,
            started_at: run.started_at,
            finished_at: run.finished_at,
            resolution,
        }
    }
}

/// One line of the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseLogEntry {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: PhaseName,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    pub message: Option<String>,
}

/// Persists run logs, run records, and incident records under the state dir.
///
/// Writing is a side channel: every failure here is logged and swallowed,
/// never escalated into run failure.
pub struct Reporter {
    state_dir: PathBuf,
}

impl Reporter {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    fn incidents_dir(&self) -> PathBuf {
        self.state_dir.join("incidents")
    }

    fn run_log_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.jsonl"))
    }

    fn run_record_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    fn incident_path(&self, run_id: &str) -> PathBuf {
        self.incidents_dir().join(format!("{run_id}.json"))
    }

    /// Append one phase event to the run log. Returns whether the write
    /// stuck, so the caller can surface a diagnostic.
    pub fn log_phase(&self, entry: &PhaseLogEntry) -> bool {
        match self.append_jsonl(&self.run_log_path(&entry.run_id), entry) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("failed to append run log: {e}");
                false
            }
        }
    }

    /// Persist the terminal run record and, for failed runs, the incident.
    ///
    /// Always called at run termination, success or failure.
    pub fn record(&self, run: &DeploymentRun, incident: Option<&IncidentRecord>) -> bool {
        let mut ok = true;

        if let Err(e) = self.write_json(&self.run_record_path(&run.id), run) {
            tracing::error!("failed to write run record for {}: {e}", run.id);
            ok = false;
        }

        if let Some(incident) = incident {
            if let Err(e) = self.write_json(&self.incident_path(&run.id), incident) {
                tracing::error!("failed to write incident record for {}: {e}", run.id);
                ok = false;
            }
        }

        ok
    }

    /// Load one run record by id.
    pub fn load_run(&self, run_id: &str) -> Option<DeploymentRun> {
        let content = fs::read_to_string(self.run_record_path(run_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Most recent terminal run for an environment, if any.
    pub fn last_run(&self, environment: &str) -> Option<DeploymentRun> {
        let entries = fs::read_dir(self.runs_dir()).ok()?;
        entries
            .flatten()
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext == "json")
            })
            .filter_map(|e| {
                let content = fs::read_to_string(e.path()).ok()?;
                serde_json::from_str::<DeploymentRun>(&content).ok()
            })
            .filter(|run| run.environment == environment)
            .max_by_key(|run| run.started_at)
    }

    /// Read back the full phase log for a run.
    pub fn read_log(&self, run_id: &str) -> Vec<PhaseLogEntry> {
        let Ok(content) = fs::read_to_string(self.run_log_path(run_id)) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn append_jsonl<T: Serialize>(&self, path: &Path, value: &T) -> std::io::Result<()> {
        fs::create_dir_all(self.runs_dir())?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(value)?;
        writeln!(file, "{line}")
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunMode;

    fn terminal_run(environment: &str, state: RunState) -> DeploymentRun {
        let mut run = DeploymentRun::new(environment, "main", RunMode::Live);
        run.transition(RunState::Running).unwrap();
        run.transition(state).unwrap();
        run
    }

    #[test]
    fn run_log_is_append_only_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path());

        for status in [PhaseStatus::Running, PhaseStatus::Success] {
            assert!(reporter.log_phase(&PhaseLogEntry {
                run_id: "run-1".into(),
                timestamp: Utc::now(),
                phase: PhaseName::Sync,
                status,
                duration_ms: 12,
                message: None,
            }));
        }

        let entries = reporter.read_log("run-1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, PhaseStatus::Running);
        assert_eq!(entries[1].status, PhaseStatus::Success);
    }

    #[test]
    fn record_persists_run_and_incident() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path());

        let run = terminal_run("production", RunState::RolledBack);
        let incident = IncidentRecord::from_run(&run, vec!["snap-1".into()]);
        assert!(reporter.record(&run, Some(&incident)));

        let loaded = reporter.last_run("production").unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.state, RunState::RolledBack);

        let incident_json =
            fs::read_to_string(dir.path().join("incidents").join(format!("{}.json", run.id)))
                .unwrap();
        let loaded: IncidentRecord = serde_json::from_str(&incident_json).unwrap();
        assert_eq!(loaded.resolution, Resolution::RolledBack);
        assert_eq!(loaded.restored_snapshots, vec!["snap-1".to_string()]);
    }

    #[test]
    fn last_run_filters_by_environment() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::new(dir.path());

        reporter.record(&terminal_run("staging", RunState::Succeeded), None);
        reporter.record(&terminal_run("production", RunState::Failed), None);

        assert_eq!(
            reporter.last_run("production").unwrap().state,
            RunState::Failed
        );
        assert!(reporter.last_run("qa").is_none());
    }

    #[test]
    fn incident_resolution_follows_run_state() {
        let run = terminal_run("production", RunState::ManualInterventionRequired);
        let incident = IncidentRecord::from_run(&run, vec![]);
        assert_eq!(incident.resolution, Resolution::ManualInterventionRequired);
    }
}
