// ABOUTME: Dry-run executor that never contacts the target.
// ABOUTME: Records every command that would have run and synthesizes success.

use super::error::ConnectivityError;
use super::{ExecOutput, Executor, RemoteCommand};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Executor for `--dry-run` mode.
///
/// Performs zero network I/O. Every command is recorded so the simulated
/// per-phase report can show what a live run would have executed.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    recorded: Mutex<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands that would have run, in order.
    pub fn recorded_commands(&self) -> Vec<String> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl Executor for DryRunExecutor {
    async fn run(&self, command: &RemoteCommand) -> Result<ExecOutput, ConnectivityError> {
        tracing::debug!(command = %command.line, "dry-run: skipping execution");
        self.recorded.lock().push(command.line.clone());
        Ok(ExecOutput::simulated())
    }

    fn target(&self) -> String {
        "dry-run (no target contacted)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_commands_and_synthesizes_success() {
        let executor = DryRunExecutor::new();

        let out = executor
            .run(&RemoteCommand::new("systemctl restart app"))
            .await
            .unwrap();
        assert!(out.success());

        executor.run(&RemoteCommand::new("true")).await.unwrap();

        assert_eq!(
            executor.recorded_commands(),
            vec!["systemctl restart app".to_string(), "true".to_string()]
        );
    }
}
