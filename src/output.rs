// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Streams per-phase markers and prints the final summary and rollback banner.

use serde::Serialize;
use std::time::Duration;

use crate::pipeline::{DeploymentRun, PhaseStatus, RunState};

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-friendly output with live phase markers.
    Normal,
    /// Minimal output for CI (only final result).
    Quiet,
    /// JSON lines for scripting.
    Json,
}

/// Handles CLI output based on the configured mode.
#[derive(Clone)]
pub struct Output {
    mode: OutputMode,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    /// Print a progress message (suppressed in quiet/json mode).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Live marker for a phase entering execution.
    pub fn phase_running(&self, name: &str) {
        match self.mode {
            OutputMode::Normal => println!("  → {name}..."),
            OutputMode::Quiet => {}
            OutputMode::Json => self.json_event("phase_running", name, None),
        }
    }

    pub fn phase_ok(&self, name: &str, duration: Duration) {
        match self.mode {
            OutputMode::Normal => println!("  ✓ {name} ({:.1}s)", duration.as_secs_f64()),
            OutputMode::Quiet => {}
            OutputMode::Json => self.json_event("phase_ok", name, Some(duration.as_secs_f64())),
        }
    }

    pub fn phase_failed(&self, name: &str, detail: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => eprintln!("  ✗ {name}: {detail}"),
            OutputMode::Json => self.json_event("phase_failed", &format!("{name}: {detail}"), None),
        }
    }

    pub fn phase_skipped(&self, name: &str, reason: &str) {
        match self.mode {
            OutputMode::Normal => println!("  - {name} skipped ({reason})"),
            OutputMode::Quiet => {}
            OutputMode::Json => {
                self.json_event("phase_skipped", &format!("{name}: {reason}"), None)
            }
        }
    }

    pub fn warn(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => eprintln!("  ! {message}"),
            OutputMode::Json => self.json_event("warning", message, None),
        }
    }

    /// Print an error message.
    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => eprintln!("Error: {message}"),
            OutputMode::Json => self.json_event("error", message, None),
        }
    }

    /// Final summary with per-status counts.
    pub fn summary(&self, run: &DeploymentRun) {
        match self.mode {
            OutputMode::Normal => {
                let (ok, failed, skipped) = run.phase_counts();
                println!();
                println!(
                    "Run {} finished: {} ({} ok, {} failed, {} skipped)",
                    run.id, run.state, ok, failed, skipped
                );
                for warning in &run.warnings {
                    println!("  ! {warning}");
                }
                for phase in &run.phases {
                    let marker = match phase.status {
                        PhaseStatus::Success => "✓",
                        PhaseStatus::Failed => "✗",
                        PhaseStatus::Skipped => "-",
                        _ => "?",
                    };
                    println!(
                        "  {marker} {:<9} {:>6}ms{}",
                        phase.name,
                        phase.duration_ms,
                        phase
                            .message
                            .as_deref()
                            .map(|m| format!("  {m}"))
                            .unwrap_or_default()
                    );
                }
            }
            OutputMode::Quiet => {
                println!("{}: {}", run.id, run.state);
            }
            OutputMode::Json => {
                if let Ok(json) = serde_json::to_string(run) {
                    println!("{json}");
                }
            }
        }
    }

    /// Banner shown when the run was rolled back or needs a human.
    pub fn rollback_banner(&self, run: &DeploymentRun) {
        if self.mode == OutputMode::Json {
            self.json_event("rollback", &run.state.to_string(), None);
            return;
        }
        eprintln!();
        eprintln!("========================================================");
        match run.state {
            RunState::RolledBack => {
                eprintln!(" DEPLOYMENT ROLLED BACK");
                eprintln!(" The target was restored from this run's snapshots.");
                eprintln!(" Next steps:");
                eprintln!("   1. Inspect the incident record and run log.");
                eprintln!("   2. Fix the failing phase before redeploying.");
            }
            RunState::ManualInterventionRequired => {
                eprintln!(" ROLLBACK FAILED - MANUAL INTERVENTION REQUIRED");
                eprintln!(" The target may be in an inconsistent state.");
                eprintln!(" No further automated action will be taken.");
                eprintln!(" Next steps:");
                eprintln!("   1. Inspect the incident record for restored snapshots.");
                eprintln!("   2. Restore remaining snapshots by hand and verify.");
            }
            _ => {}
        }
        if let Some(phase) = run.failed_phase {
            eprintln!(" Failed phase: {phase}");
        }
        eprintln!("========================================================");
    }

    fn json_event(&self, event: &str, message: &str, duration_secs: Option<f64>) {
        let event = JsonEvent {
            event,
            message,
            duration_secs,
        };
        if let Ok(json) = serde_json::to_string(&event) {
            println!("{json}");
        }
    }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    event: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
}
