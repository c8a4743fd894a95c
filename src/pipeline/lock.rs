// ABOUTME: Deployment lock to prevent concurrent runs against the same target.
// ABOUTME: Uses atomic file creation in the local state directory, keyed by environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Information about who holds a deployment lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine that holds the lock.
    pub holder: String,
    /// Process ID of the lock holder.
    pub pid: u32,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Target environment the lock protects.
    pub environment: String,
    /// Application being deployed.
    pub app: String,
}

impl LockInfo {
    pub fn new(app: &str, environment: &str) -> Self {
        Self {
            holder: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            environment: environment.to_string(),
            app: app.to_string(),
        }
    }

    /// Check if this lock is stale (older than 1 hour).
    pub fn is_stale(&self) -> bool {
        let age = Utc::now() - self.acquired_at;
        age.num_hours() >= 1
    }

    /// Path to the lock file for an environment.
    pub fn lock_path(state_dir: &Path, environment: &str) -> PathBuf {
        state_dir.join(format!("{environment}.lock"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("deployment lock held by {holder} (pid {pid}) since {since}")]
    Held {
        holder: String,
        pid: u32,
        since: DateTime<Utc>,
    },

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize lock info: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A held deployment lock, released explicitly or on drop.
#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
    released: bool,
}

impl DeployLock {
    /// Acquire the lock for an environment.
    ///
    /// `create_new` gives atomic create-if-not-exists, so there is no TOCTOU
    /// race between two runs. A stale lock (>1 hour) is auto-broken with a
    /// warning; `force` breaks any lock. A valid held lock fails immediately
    /// without touching anything else.
    pub fn acquire(
        state_dir: &Path,
        app: &str,
        environment: &str,
        force: bool,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(state_dir)?;
        let path = LockInfo::lock_path(state_dir, environment);

        let info = LockInfo::new(app, environment);
        let json = serde_json::to_string_pretty(&info)?;

        match Self::try_create(&path, &json) {
            Ok(()) => {
                return Ok(Self {
                    path,
                    released: false,
                });
            }
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => {
                return Err(LockError::Io(e));
            }
            Err(_) => {}
        }

        // Lock file exists: break it only if stale, forced, or corrupted.
        if !Self::should_break(&path, force)? {
            let existing = fs::read_to_string(&path)?;
            if let Ok(held) = serde_json::from_str::<LockInfo>(&existing) {
                return Err(LockError::Held {
                    holder: held.holder,
                    pid: held.pid,
                    since: held.acquired_at,
                });
            }
            return Err(LockError::Held {
                holder: "unknown".to_string(),
                pid: 0,
                since: Utc::now(),
            });
        }

        tracing::debug!(path = %path.display(), "removing stale/forced lock");
        let _ = fs::remove_file(&path);

        // Retry once; losing this race means another run slipped in.
        match Self::try_create(&path, &json) {
            Ok(()) => Ok(Self {
                path,
                released: false,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = fs::read_to_string(&path).unwrap_or_default();
                let held: LockInfo = serde_json::from_str(&existing).unwrap_or_else(|_| {
                    LockInfo::new("unknown", environment)
                });
                Err(LockError::Held {
                    holder: held.holder,
                    pid: held.pid,
                    since: held.acquired_at,
                })
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn try_create(path: &Path, contents: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(contents.as_bytes())
    }

    /// Whether an existing lock should be broken (stale, forced, corrupted).
    fn should_break(path: &Path, force: bool) -> Result<bool, LockError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => {
                tracing::warn!("lock info unreadable, breaking lock");
                return Ok(true);
            }
        };

        match serde_json::from_str::<LockInfo>(&contents) {
            Ok(existing) => {
                if force {
                    tracing::warn!(
                        "breaking lock held by {} (pid {}) since {}",
                        existing.holder,
                        existing.pid,
                        existing.acquired_at
                    );
                    Ok(true)
                } else if existing.is_stale() {
                    tracing::warn!(
                        "auto-breaking stale lock held by {} (pid {}) since {}",
                        existing.holder,
                        existing.pid,
                        existing.acquired_at
                    );
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(_) => {
                tracing::warn!("lock info corrupted, breaking lock");
                Ok(true)
            }
        }
    }

    /// Release the lock.
    pub fn release(mut self) {
        self.released = true;
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_info_captures_host_and_pid() {
        let info = LockInfo::new("shop", "production");
        assert_eq!(info.environment, "production");
        assert_eq!(info.pid, std::process::id());
        assert!(!info.holder.is_empty());
        assert!(!info.is_stale());
    }

    #[test]
    fn old_lock_is_stale() {
        let mut info = LockInfo::new("shop", "production");
        info.acquired_at = Utc::now() - chrono::Duration::hours(2);
        assert!(info.is_stale());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DeployLock::acquire(dir.path(), "shop", "production", false).unwrap();

        let err = DeployLock::acquire(dir.path(), "shop", "production", false).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));

        lock.release();
        DeployLock::acquire(dir.path(), "shop", "production", false).unwrap();
    }

    #[test]
    fn locks_are_keyed_by_environment() {
        let dir = tempfile::tempdir().unwrap();
        let _prod = DeployLock::acquire(dir.path(), "shop", "production", false).unwrap();
        // A different environment is a different lock.
        DeployLock::acquire(dir.path(), "shop", "staging", false).unwrap();
    }

    #[test]
    fn force_breaks_a_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = LockInfo::lock_path(dir.path(), "production");
        let info = LockInfo::new("other-host", "production");
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();

        assert!(DeployLock::acquire(dir.path(), "shop", "production", false).is_err());
        DeployLock::acquire(dir.path(), "shop", "production", true).unwrap();
    }

    #[test]
    fn stale_lock_is_auto_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = LockInfo::lock_path(dir.path(), "production");
        let mut info = LockInfo::new("other-host", "production");
        info.acquired_at = Utc::now() - chrono::Duration::hours(3);
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();

        DeployLock::acquire(dir.path(), "shop", "production", false).unwrap();
    }

    #[test]
    fn corrupted_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = LockInfo::lock_path(dir.path(), "production");
        std::fs::write(&path, "not json").unwrap();

        DeployLock::acquire(dir.path(), "shop", "production", false).unwrap();
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = DeployLock::acquire(dir.path(), "shop", "production", false).unwrap();
        }
        DeployLock::acquire(dir.path(), "shop", "production", false).unwrap();
    }
}
