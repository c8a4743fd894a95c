// ABOUTME: Command configuration for pipeline phases and backups.
// ABOUTME: Each phase runs a configured shell command on the target.

use crate::snapshot::SnapshotKind;
use serde::Deserialize;

/// Commands the pipeline runs on the target, one per phase.
///
/// A phase whose command is absent is skipped as not-configured. `{branch}`
/// in the sync command and `{service}` in the restart/status templates are
/// substituted at execution time.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CommandsConfig {
    #[serde(default)]
    pub precheck: Option<String>,

    #[serde(default)]
    pub sync: Option<String>,

    #[serde(default)]
    pub build: Option<String>,

    #[serde(default)]
    pub migrate_plan: Option<String>,

    #[serde(default)]
    pub migrate: Option<String>,

    #[serde(default = "default_restart_template")]
    pub restart: String,

    #[serde(default = "default_status_template")]
    pub status: String,
}

fn default_restart_template() -> String {
    "sudo systemctl restart {service}".to_string()
}

fn default_status_template() -> String {
    "systemctl is-active {service}".to_string()
}

/// What to do when creating a restore point fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupFailurePolicy {
    /// Stop the run before anything is mutated.
    #[default]
    Abort,
    /// Continue without a snapshot for that kind; the run is marked degraded.
    Continue,
}

/// Per-kind commands, e.g. one dump command per snapshot kind.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KindCommands {
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub config: Option<String>,
}

impl KindCommands {
    pub fn get(&self, kind: SnapshotKind) -> Option<&str> {
        match kind {
            SnapshotKind::Database => self.database.as_deref(),
            SnapshotKind::Code => self.code.as_deref(),
            SnapshotKind::Config => self.config.as_deref(),
        }
    }
}

/// Backup service configuration: create/restore commands and failure policy.
///
/// Create commands print the storage reference on stdout as `ref=...` and
/// optionally `checksum=...`; restore commands receive the reference via
/// `{ref}` substitution.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackupConfig {
    #[serde(default)]
    pub on_failure: BackupFailurePolicy,

    #[serde(default)]
    pub create: KindCommands,

    #[serde(default)]
    pub restore: KindCommands,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_template_defaults_to_systemctl() {
        let cmds: CommandsConfig = serde_yaml::from_str("sync: git pull").unwrap();
        assert_eq!(cmds.restart, "sudo systemctl restart {service}");
        assert_eq!(cmds.status, "systemctl is-active {service}");
        assert_eq!(cmds.sync.as_deref(), Some("git pull"));
        assert!(cmds.migrate.is_none());
    }

    #[test]
    fn backup_policy_defaults_to_abort() {
        let backup: BackupConfig = serde_yaml::from_str("create:\n  database: pg_dump").unwrap();
        assert_eq!(backup.on_failure, BackupFailurePolicy::Abort);
        assert_eq!(
            backup.create.get(SnapshotKind::Database),
            Some("pg_dump")
        );
        assert!(backup.create.get(SnapshotKind::Code).is_none());
    }

    #[test]
    fn continue_policy_parses() {
        let backup: BackupConfig = serde_yaml::from_str("on_failure: continue").unwrap();
        assert_eq!(backup.on_failure, BackupFailurePolicy::Continue);
    }
}
