// ABOUTME: Remote execution client for running commands against a target.
// ABOUTME: Exports the Executor trait plus SSH-backed and dry-run implementations.

mod dry_run;
mod error;
mod ssh;

pub use dry_run::DryRunExecutor;
pub use error::{ConnectivityError, ConnectivityErrorKind};
pub use ssh::{RetryPolicy, SshExecutor, TargetAddress};

use async_trait::async_trait;
use std::time::Duration;

/// Default per-command timeout (5 minutes).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// A command to run on the target, with its execution timeout.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub line: String,
    pub timeout: Duration,
}

impl RemoteCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Output from a remote command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code of the command.
    pub exit_code: u32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Synthesized success output, used by the dry-run executor.
    pub fn simulated() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Runs a single command against the target environment.
///
/// A non-zero exit code from the remote command is an `Ok` result with a
/// failing `ExecOutput`; `ConnectivityError` is reserved for failures to
/// reach the target at all.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, command: &RemoteCommand) -> Result<ExecOutput, ConnectivityError>;

    /// Human-readable description of the target, for logs and reports.
    fn target(&self) -> String;
}
