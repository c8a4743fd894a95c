// ABOUTME: Restore point types captured before mutating phases.
// ABOUTME: Exports snapshot kinds, the per-run snapshot set, and the backup service.

mod service;

pub use service::{BackupError, BackupService, CommandBackupService, SnapshotContext};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::PhaseName;

/// What a snapshot protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Database,
    Code,
    Config,
}

impl SnapshotKind {
    /// The mutating phase this kind of snapshot is taken for.
    pub fn protected_phase(&self) -> PhaseName {
        match self {
            SnapshotKind::Code => PhaseName::Sync,
            SnapshotKind::Config => PhaseName::Build,
            SnapshotKind::Database => PhaseName::Migrate,
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Database => write!(f, "database"),
            SnapshotKind::Code => write!(f, "code"),
            SnapshotKind::Config => write!(f, "config"),
        }
    }
}

/// A restore point created within one deployment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub run_id: String,
    pub kind: SnapshotKind,
    /// Where the backup service stored the restore point.
    pub storage_ref: String,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    /// The mutating phase this snapshot was taken for.
    pub phase: PhaseName,
    /// True when created by a dry run (nothing was actually stored).
    #[serde(default)]
    pub simulated: bool,
}

/// Snapshots created within a single run, in creation order.
///
/// Rollback only ever consumes snapshots from this set, which is owned by
/// the run that created them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotSet {
    snapshots: Vec<Snapshot>,
}

impl SnapshotSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn has_kind(&self, kind: SnapshotKind) -> bool {
        self.snapshots.iter().any(|s| s.kind == kind)
    }

    /// Most recent snapshot of a kind, if any.
    pub fn latest_of(&self, kind: SnapshotKind) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.kind == kind)
    }

    /// All snapshots, newest first. Rollback restores in this order.
    pub fn newest_first(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter().rev()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
