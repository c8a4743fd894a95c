// ABOUTME: Backup service boundary and its command-backed implementation.
// ABOUTME: Creating and restoring snapshots runs configured commands on the target.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BackupConfig;
use crate::pipeline::PhaseName;
use crate::remote::{ConnectivityError, Executor, RemoteCommand};

use super::{Snapshot, SnapshotKind};

/// Errors from creating or restoring restore points.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("no backup command configured for {kind} snapshots")]
    NoCommand { kind: SnapshotKind },

    #[error("failed to create {kind} snapshot: {reason}")]
    CreateFailed { kind: SnapshotKind, reason: String },

    #[error("failed to restore {kind} snapshot {id}: {reason}")]
    RestoreFailed {
        kind: SnapshotKind,
        id: String,
        reason: String,
    },

    #[error("cannot reach target: {0}")]
    Connectivity(#[from] ConnectivityError),
}

/// Run context a snapshot is created in.
#[derive(Debug, Clone)]
pub struct SnapshotContext {
    pub run_id: String,
    pub app: String,
    /// The mutating phase the snapshot protects.
    pub phase: PhaseName,
}

/// Creates and restores named restore points.
///
/// Restore is idempotent: restoring the same snapshot twice yields the same
/// end state.
#[async_trait]
pub trait BackupService: Send + Sync {
    async fn create_backup(
        &self,
        kind: SnapshotKind,
        ctx: &SnapshotContext,
    ) -> Result<Snapshot, BackupError>;

    async fn restore_backup(&self, snapshot: &Snapshot) -> Result<(), BackupError>;
}

/// Backup service that drives configured shell commands through an executor.
///
/// Create commands may print `ref=...` and `checksum=...` lines on stdout;
/// absent a `ref=` line the generated snapshot id doubles as the storage
/// reference. Restore commands receive the reference via `{ref}`.
pub struct CommandBackupService {
    executor: Arc<dyn Executor>,
    backup: BackupConfig,
    command_timeout: Duration,
    /// True when driving a dry-run executor; produced snapshots are marked
    /// simulated and must never be restored for real.
    simulated: bool,
}

impl CommandBackupService {
    pub fn new(
        executor: Arc<dyn Executor>,
        backup: BackupConfig,
        command_timeout: Duration,
        simulated: bool,
    ) -> Self {
        Self {
            executor,
            backup,
            command_timeout,
            simulated,
        }
    }

    fn parse_field(stdout: &str, field: &str) -> Option<String> {
        stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(field))
            .map(|rest| rest.trim().to_string())
            .next_back()
    }
}

#[async_trait]
impl BackupService for CommandBackupService {
    async fn create_backup(
        &self,
        kind: SnapshotKind,
        ctx: &SnapshotContext,
    ) -> Result<Snapshot, BackupError> {
        let command = self
            .backup
            .create
            .get(kind)
            .ok_or(BackupError::NoCommand { kind })?;

        let created_at = Utc::now();
        let id = format!(
            "{}-{}-{}",
            ctx.app,
            kind,
            created_at.format("%Y%m%d%H%M%S")
        );

        tracing::info!(%kind, snapshot = %id, "creating restore point");

        let output = self
            .executor
            .run(&RemoteCommand::new(command).timeout(self.command_timeout))
            .await?;

        if !output.success() {
            return Err(BackupError::CreateFailed {
                kind,
                reason: if output.stderr.trim().is_empty() {
                    format!("backup command exited {}", output.exit_code)
                } else {
                    output.stderr.trim().to_string()
                },
            });
        }

        let storage_ref =
            Self::parse_field(&output.stdout, "ref=").unwrap_or_else(|| id.clone());
        let checksum = Self::parse_field(&output.stdout, "checksum=");

        Ok(Snapshot {
            id,
            run_id: ctx.run_id.clone(),
            kind,
            storage_ref,
            checksum,
            created_at,
            phase: ctx.phase,
            simulated: self.simulated,
        })
    }

    async fn restore_backup(&self, snapshot: &Snapshot) -> Result<(), BackupError> {
        let template =
            self.backup
                .restore
                .get(snapshot.kind)
                .ok_or(BackupError::NoCommand {
                    kind: snapshot.kind,
                })?;

        let command = template.replace("{ref}", &snapshot.storage_ref);

        tracing::info!(kind = %snapshot.kind, snapshot = %snapshot.id, "restoring snapshot");

        let output = self
            .executor
            .run(&RemoteCommand::new(command).timeout(self.command_timeout))
            .await?;

        if !output.success() {
            return Err(BackupError::RestoreFailed {
                kind: snapshot.kind,
                id: snapshot.id.clone(),
                reason: if output.stderr.trim().is_empty() {
                    format!("restore command exited {}", output.exit_code)
                } else {
                    output.stderr.trim().to_string()
                },
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindCommands;
    use crate::remote::DryRunExecutor;

    fn backup_config() -> BackupConfig {
        BackupConfig {
            on_failure: Default::default(),
            create: KindCommands {
                database: Some("pg-backup".to_string()),
                code: None,
                config: None,
            },
            restore: KindCommands {
                database: Some("pg-restore {ref}".to_string()),
                code: None,
                config: None,
            },
        }
    }

    fn ctx() -> SnapshotContext {
        SnapshotContext {
            run_id: "run-1".to_string(),
            app: "shop".to_string(),
            phase: PhaseName::Migrate,
        }
    }

    #[test]
    fn parses_last_ref_and_checksum_lines() {
        let stdout = "progress 50%\nref=/backups/a\nref=/backups/b\nchecksum=abc123\n";
        assert_eq!(
            CommandBackupService::parse_field(stdout, "ref="),
            Some("/backups/b".to_string())
        );
        assert_eq!(
            CommandBackupService::parse_field(stdout, "checksum="),
            Some("abc123".to_string())
        );
        assert_eq!(CommandBackupService::parse_field("noise", "ref="), None);
    }

    #[tokio::test]
    async fn unconfigured_kind_errors_without_running_anything() {
        let executor = Arc::new(DryRunExecutor::new());
        let service = CommandBackupService::new(
            Arc::clone(&executor) as Arc<dyn Executor>,
            backup_config(),
            Duration::from_secs(60),
            true,
        );

        let err = service
            .create_backup(SnapshotKind::Code, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NoCommand { .. }));
        assert!(executor.recorded_commands().is_empty());
    }

    #[tokio::test]
    async fn dry_run_snapshot_is_marked_simulated() {
        let executor = Arc::new(DryRunExecutor::new());
        let service = CommandBackupService::new(
            Arc::clone(&executor) as Arc<dyn Executor>,
            backup_config(),
            Duration::from_secs(60),
            true,
        );

        let snapshot = service
            .create_backup(SnapshotKind::Database, &ctx())
            .await
            .unwrap();
        assert!(snapshot.simulated);
        assert_eq!(snapshot.run_id, "run-1");
        assert_eq!(snapshot.phase, PhaseName::Migrate);
        // Without a ref= line the id doubles as the storage reference.
        assert_eq!(snapshot.storage_ref, snapshot.id);
        assert_eq!(executor.recorded_commands(), vec!["pg-backup".to_string()]);
    }

    #[tokio::test]
    async fn restore_substitutes_the_storage_ref() {
        let executor = Arc::new(DryRunExecutor::new());
        let service = CommandBackupService::new(
            Arc::clone(&executor) as Arc<dyn Executor>,
            backup_config(),
            Duration::from_secs(60),
            true,
        );

        let snapshot = Snapshot {
            id: "shop-database-1".to_string(),
            run_id: "run-1".to_string(),
            kind: SnapshotKind::Database,
            storage_ref: "/backups/shop.dump".to_string(),
            checksum: None,
            created_at: Utc::now(),
            phase: PhaseName::Migrate,
            simulated: true,
        };

        service.restore_backup(&snapshot).await.unwrap();
        assert_eq!(
            executor.recorded_commands(),
            vec!["pg-restore /backups/shop.dump".to_string()]
        );
    }
}
