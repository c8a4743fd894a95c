// ABOUTME: Rollback controller invoked on blocking phase failure.
// ABOUTME: Restores same-run snapshots, restarts services, revalidates health.

use std::sync::Arc;
use std::time::Duration;

use crate::config::CheckConfig;
use crate::pipeline::DeploymentRun;
use crate::remote::Executor;
use crate::report::Resolution;
use crate::services::ServiceManager;
use crate::snapshot::BackupService;
use crate::verify::{self, VerificationReport};

/// What the rollback controller did and how it ended.
#[derive(Debug)]
pub struct RollbackReport {
    /// Snapshot ids restored, newest first.
    pub restored: Vec<String>,
    pub resolution: Resolution,
    pub revalidation: Option<VerificationReport>,
}

/// Restore the target from the failing run's own snapshots.
///
/// Snapshots are restored newest first so later mutations unwind before the
/// state they were built on. Only snapshots recorded in `run` are touched;
/// a snapshot from any other run is out of reach by construction. If a
/// restore fails the controller stops and escalates: the resulting
/// `ManualInterventionRequired` is terminal and never auto-retried.
pub async fn run_rollback(
    run: &DeploymentRun,
    backup: &dyn BackupService,
    service_manager: &dyn ServiceManager,
    executor: Arc<dyn Executor>,
    checks: &[CheckConfig],
    services: &[String],
) -> RollbackReport {
    let mut restored = Vec::new();

    for snapshot in run.snapshots.newest_first() {
        match backup.restore_backup(snapshot).await {
            Ok(()) => {
                tracing::info!(snapshot = %snapshot.id, "restored snapshot");
                restored.push(snapshot.id.clone());
            }
            Err(e) => {
                tracing::error!(snapshot = %snapshot.id, "restore failed: {e}");
                return RollbackReport {
                    restored,
                    resolution: Resolution::ManualInterventionRequired,
                    revalidation: None,
                };
            }
        }
    }

    // Dependent services must come back on the restored state.
    for name in services {
        if let Err(e) = service_manager.restart(name).await {
            tracing::error!(service = %name, "restart after restore failed: {e}");
            return RollbackReport {
                restored,
                resolution: Resolution::ManualInterventionRequired,
                revalidation: None,
            };
        }
    }

    // Re-run the minimal check subset, strict: a rollback that does not
    // verify healthy needs a human.
    let minimal = verify::minimal_subset(checks);
    let revalidation = if minimal.is_empty() {
        None
    } else {
        Some(verify::verify(executor, &minimal, true, 2, Duration::from_secs(120)).await)
    };

    let resolution = match &revalidation {
        Some(report) if report.verdict.is_blocking() => Resolution::ManualInterventionRequired,
        _ => Resolution::RolledBack,
    };

    RollbackReport {
        restored,
        resolution,
        revalidation,
    }
}
