// ABOUTME: Application-wide error types for lockstep.
// ABOUTME: Maps every failure class to a process exit code.

use std::path::PathBuf;
use thiserror::Error;

use crate::remote::ConnectivityError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot reach target: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("deployment already in progress for {environment} (held by {holder}, pid {pid})")]
    ConcurrentDeployment {
        environment: String,
        holder: String,
        pid: u32,
    },

    #[error("deployment failed and was rolled back")]
    RolledBack,

    #[error("deployment failed before mutating the target")]
    Failed,

    #[error("rollback failed: manual intervention required")]
    ManualInterventionRequired,

    #[error("no completed run found for {0}")]
    NoRunHistory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Process exit code for this error.
    ///
    /// 1: run failed or was rolled back. 2: rollback itself failed and a
    /// human has to intervene. 3: the run never started (configuration,
    /// connectivity, or lock contention).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::RolledBack | Error::Failed => 1,
            Error::ManualInterventionRequired => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_run_failures_exit_3() {
        assert_eq!(Error::ConfigNotFound(PathBuf::from("/tmp")).exit_code(), 3);
        assert_eq!(
            Error::ConcurrentDeployment {
                environment: "prod".into(),
                holder: "ci-01".into(),
                pid: 42,
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn rolled_back_exits_1() {
        assert_eq!(Error::RolledBack.exit_code(), 1);
        assert_eq!(Error::Failed.exit_code(), 1);
    }

    #[test]
    fn manual_intervention_exits_2() {
        assert_eq!(Error::ManualInterventionRequired.exit_code(), 2);
    }
}
