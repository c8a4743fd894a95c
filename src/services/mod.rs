// ABOUTME: Collaborator boundaries: code sync, build, migration, service manager, notifier.
// ABOUTME: Command-backed implementations drive configured shell commands through an executor.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CommandsConfig;
use crate::remote::{ConnectivityError, ExecOutput, Executor, RemoteCommand};

/// Errors from collaborator services.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no {0} command configured")]
    NotConfigured(&'static str),

    #[error("command exited {exit_code}: {detail}")]
    CommandFailed { exit_code: u32, detail: String },

    #[error("cannot reach target: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("notification failed: {0}")]
    NotifyFailed(String),
}

/// Runs the pre-deployment sanity checks on the target.
#[async_trait]
pub trait Prechecker: Send + Sync {
    async fn precheck(&self) -> Result<(), ServiceError>;
}

/// Synchronizes the code tree on the target to a branch.
#[async_trait]
pub trait CodeSync: Send + Sync {
    async fn sync(&self, branch: &str) -> Result<(), ServiceError>;
}

/// Builds/installs the synced code on the target.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self) -> Result<(), ServiceError>;
}

/// A pending migration, one line of the plan command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
}

/// Plans and applies database migrations.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn plan(&self) -> Result<Vec<Migration>, ServiceError>;
    async fn apply(&self) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
}

/// Restarts and inspects the managed system services on the target.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn restart(&self, name: &str) -> Result<(), ServiceError>;
    async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError>;
}

/// Delivers run outcome notifications. Failures are warnings, never errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), ServiceError>;
}

/// All collaborator traits implemented over configured shell commands.
///
/// `{branch}` is substituted into the sync command and `{service}` into the
/// restart/status templates. The configured env map is exported as a prefix
/// so commands see the same environment in live and dry runs.
pub struct RemoteCommands {
    executor: Arc<dyn Executor>,
    commands: CommandsConfig,
    env: HashMap<String, String>,
    command_timeout: Duration,
}

impl RemoteCommands {
    pub fn new(
        executor: Arc<dyn Executor>,
        commands: CommandsConfig,
        env: HashMap<String, String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            commands,
            env,
            command_timeout,
        }
    }

    /// Prefix a command with exports for the configured environment.
    fn with_env(&self, command: &str) -> String {
        if self.env.is_empty() {
            return command.to_string();
        }
        let mut pairs: Vec<_> = self.env.iter().collect();
        pairs.sort_by_key(|(k, _)| k.as_str());
        let exports = pairs
            .iter()
            .map(|(k, v)| format!("{}='{}'", k, v.replace('\'', "'\\''")))
            .collect::<Vec<_>>()
            .join(" ");
        format!("export {exports}; {command}")
    }

    async fn run_line(&self, line: String) -> Result<ExecOutput, ServiceError> {
        let output = self
            .executor
            .run(&RemoteCommand::new(self.with_env(&line)).timeout(self.command_timeout))
            .await?;
        if !output.success() {
            return Err(ServiceError::CommandFailed {
                exit_code: output.exit_code,
                detail: if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            });
        }
        Ok(output)
    }

}

#[async_trait]
impl Prechecker for RemoteCommands {
    async fn precheck(&self) -> Result<(), ServiceError> {
        match &self.commands.precheck {
            Some(cmd) => self.run_line(cmd.clone()).await.map(|_| ()),
            // With nothing configured the connectivity probe is the precheck.
            None => self.run_line("true".to_string()).await.map(|_| ()),
        }
    }
}

#[async_trait]
impl CodeSync for RemoteCommands {
    async fn sync(&self, branch: &str) -> Result<(), ServiceError> {
        let template = self
            .commands
            .sync
            .as_ref()
            .ok_or(ServiceError::NotConfigured("sync"))?;
        self.run_line(template.replace("{branch}", branch))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Builder for RemoteCommands {
    async fn build(&self) -> Result<(), ServiceError> {
        let command = self
            .commands
            .build
            .as_ref()
            .ok_or(ServiceError::NotConfigured("build"))?;
        self.run_line(command.clone()).await.map(|_| ())
    }
}

#[async_trait]
impl Migrator for RemoteCommands {
    async fn plan(&self) -> Result<Vec<Migration>, ServiceError> {
        let command = match &self.commands.migrate_plan {
            Some(cmd) => cmd,
            None => return Ok(Vec::new()),
        };
        let output = self.run_line(command.clone()).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| Migration {
                name: l.to_string(),
            })
            .collect())
    }

    async fn apply(&self) -> Result<(), ServiceError> {
        let command = self
            .commands
            .migrate
            .as_ref()
            .ok_or(ServiceError::NotConfigured("migrate"))?;
        self.run_line(command.clone()).await.map(|_| ())
    }
}

#[async_trait]
impl ServiceManager for RemoteCommands {
    async fn restart(&self, name: &str) -> Result<(), ServiceError> {
        self.run_line(self.commands.restart.replace("{service}", name))
            .await
            .map(|_| ())
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        let line = self.commands.status.replace("{service}", name);
        let output = self
            .executor
            .run(&RemoteCommand::new(self.with_env(&line)).timeout(self.command_timeout))
            .await?;
        if output.success() {
            Ok(ServiceStatus::Running)
        } else {
            Ok(ServiceStatus::Stopped)
        }
    }
}

/// Notifier that posts to a webhook with a local `curl` invocation.
///
/// Requires `curl` on the operator machine's PATH.
pub struct WebhookNotifier {
    webhook_url: String,
    program: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self::with_program(webhook_url, "curl")
    }

    fn with_program(webhook_url: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            program: program.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), ServiceError> {
        let payload = serde_json::json!({
            "channel": channel,
            "text": message,
        });

        let status = tokio::process::Command::new(&self.program)
            .arg("-fsS")
            .arg("-X")
            .arg("POST")
            .arg("-H")
            .arg("Content-Type: application/json")
            .arg("-d")
            .arg(payload.to_string())
            .arg(&self.webhook_url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ServiceError::NotifyFailed(format!(
                        "{} not found on PATH; webhook delivery needs it installed",
                        self.program
                    ))
                } else {
                    ServiceError::NotifyFailed(e.to_string())
                }
            })?;

        if !status.success() {
            return Err(ServiceError::NotifyFailed(format!(
                "webhook returned exit {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}
