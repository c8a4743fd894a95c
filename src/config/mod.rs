// ABOUTME: Configuration types and parsing for lockstep.yml.
// ABOUTME: Handles YAML parsing, env var interpolation, and environment merging.

mod checks;
mod commands;
mod env_value;
mod init;
mod target;

pub use checks::{CheckConfig, FailureGrade, VerifyConfig};
pub use commands::{BackupConfig, BackupFailurePolicy, CommandsConfig, KindCommands};
pub use env_value::{EnvValue, resolve_env_map};
pub use init::init_config;
pub use target::TargetConfig;

use crate::error::{Error, Result};
use crate::snapshot::SnapshotKind;
use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "lockstep.yml";
pub const CONFIG_FILENAME_ALT: &str = "lockstep.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".lockstep/config.yml";

/// Where run logs, incident records, and lock files live.
const STATE_DIR: &str = ".local/state/lockstep";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Application name, used in snapshots, lock records, and reports.
    pub app: String,

    pub target: TargetConfig,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(deserialize_with = "deserialize_services")]
    pub services: NonEmpty<String>,

    #[serde(default)]
    pub env: HashMap<String, EnvValue>,

    #[serde(default)]
    pub checks: Vec<CheckConfig>,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub notify: Option<NotifyConfig>,

    #[serde(default)]
    pub environments: HashMap<String, EnvironmentOverride>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Connection retry and timeout settings for the remote execution client.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
        }
    }
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    pub channel: String,

    /// Webhook URL, usually pulled from the environment to keep it out of
    /// the config file.
    #[serde(default)]
    pub webhook: Option<EnvValue>,
}

/// Per-environment overrides merged over the base config.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnvironmentOverride {
    #[serde(default)]
    pub target: Option<TargetConfig>,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default, deserialize_with = "deserialize_services_option")]
    pub services: Option<NonEmpty<String>>,

    #[serde(default)]
    pub env: HashMap<String, EnvValue>,

    #[serde(default)]
    pub checks: Option<Vec<CheckConfig>>,

    #[serde(default)]
    pub verify: Option<VerifyConfig>,

    #[serde(default)]
    pub commands: Option<CommandsConfig>,

    #[serde(default)]
    pub backup: Option<BackupConfig>,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    /// Apply overrides for a named environment.
    pub fn for_environment(&self, name: &str) -> Result<Config> {
        let over = self
            .environments
            .get(name)
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string()))?;

        let mut merged = self.clone();

        if let Some(ref target) = over.target {
            merged.target = target.clone();
        }
        if let Some(ref branch) = over.branch {
            merged.branch = branch.clone();
        }
        if let Some(ref services) = over.services {
            merged.services = services.clone();
        }
        for (k, v) in &over.env {
            merged.env.insert(k.clone(), v.clone());
        }
        if let Some(ref checks) = over.checks {
            merged.checks = checks.clone();
        }
        if let Some(ref verify) = over.verify {
            merged.verify = verify.clone();
        }
        if let Some(ref commands) = over.commands {
            merged.commands = commands.clone();
        }
        if let Some(ref backup) = over.backup {
            merged.backup = backup.clone();
        }

        merged.validate()?;
        Ok(merged)
    }

    /// Local directory for run logs, incidents, and lock files.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(STATE_DIR)
    }

    /// Snapshot kinds the configured phases mutate, in pipeline order.
    pub fn required_snapshot_kinds(&self) -> Vec<SnapshotKind> {
        let mut kinds = Vec::new();
        if self.commands.sync.is_some() {
            kinds.push(SnapshotKind::Code);
        }
        if self.commands.build.is_some() {
            kinds.push(SnapshotKind::Config);
        }
        if self.commands.migrate.is_some() {
            kinds.push(SnapshotKind::Database);
        }
        kinds
    }

    /// Validate cross-field constraints that serde cannot express.
    fn validate(&self) -> Result<()> {
        if self.app.trim().is_empty() {
            return Err(Error::InvalidConfig("app name cannot be empty".into()));
        }
        if self.verify.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "verify.concurrency must be at least 1".into(),
            ));
        }

        // Every mutating phase needs a restore path for its snapshot kind.
        for kind in self.required_snapshot_kinds() {
            if self.backup.create.get(kind).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "backup.create.{kind} is required because the {} phase is configured",
                    kind.protected_phase()
                )));
            }
            if self.backup.restore.get(kind).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "backup.restore.{kind} is required because the {} phase is configured",
                    kind.protected_phase()
                )));
            }
        }

        Ok(())
    }

    pub fn template() -> Self {
        Config {
            app: "my-app".to_string(),
            target: TargetConfig {
                host: "app.example.com".to_string(),
                port: 22,
                user: Some("deploy".to_string()),
                key_path: None,
                trust_first_connection: true,
            },
            branch: default_branch(),
            state_dir: None,
            remote: RemoteConfig::default(),
            backup: BackupConfig {
                on_failure: BackupFailurePolicy::Abort,
                create: KindCommands {
                    database: Some("/opt/my-app/bin/backup-db".to_string()),
                    code: Some("/opt/my-app/bin/backup-code".to_string()),
                    config: Some("/opt/my-app/bin/backup-config".to_string()),
                },
                restore: KindCommands {
                    database: Some("/opt/my-app/bin/restore-db {ref}".to_string()),
                    code: Some("/opt/my-app/bin/restore-code {ref}".to_string()),
                    config: Some("/opt/my-app/bin/restore-config {ref}".to_string()),
                },
            },
            commands: CommandsConfig {
                precheck: Some("df -h /srv && git -C /srv/my-app status".to_string()),
                sync: Some("git -C /srv/my-app fetch && git -C /srv/my-app checkout {branch}".to_string()),
                build: Some("cd /srv/my-app && make install".to_string()),
                migrate_plan: Some("cd /srv/my-app && make migrate-plan".to_string()),
                migrate: Some("cd /srv/my-app && make migrate".to_string()),
                restart: "sudo systemctl restart {service}".to_string(),
                status: "systemctl is-active {service}".to_string(),
            },
            services: NonEmpty::new("my-app".to_string()),
            env: HashMap::new(),
            checks: vec![],
            verify: VerifyConfig::default(),
            notify: None,
            environments: HashMap::new(),
        }
    }
}

// Custom deserializers

fn deserialize_services<'de, D>(deserializer: D) -> std::result::Result<NonEmpty<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let services = Vec::<String>::deserialize(deserializer)?;
    NonEmpty::from_vec(services)
        .ok_or_else(|| serde::de::Error::custom("services list cannot be empty"))
}

fn deserialize_services_option<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<NonEmpty<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let services = Option::<Vec<String>>::deserialize(deserializer)?;
    match services {
        None => Ok(None),
        Some(list) => NonEmpty::from_vec(list)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("services list cannot be empty")),
    }
}
