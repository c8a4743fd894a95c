// ABOUTME: Config scaffolding for new projects.
// ABOUTME: Creates lockstep.yml template files.

use std::path::Path;

use crate::error::{Error, Result};

use super::{CONFIG_FILENAME, Config};

pub fn init_config(dir: &Path, app: Option<&str>, force: bool) -> Result<()> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }

    let mut config = Config::template();

    if let Some(name) = app {
        if name.trim().is_empty() {
            return Err(Error::InvalidConfig("app name cannot be empty".into()));
        }
        config.app = name.to_string();
    }

    let yaml = generate_template_yaml(&config);
    std::fs::write(&config_path, yaml)?;

    Ok(())
}

fn generate_template_yaml(config: &Config) -> String {
    format!(
        r##"app: {app}
target:
  host: {host}
  port: {port}
  user: {user}
  # SSH host key verification: pre-populate ~/.ssh/known_hosts, or rely on
  # Trust-On-First-Use (default: true)
  # trust_first_connection: true

branch: {branch}

# Services restarted after a deploy (and during rollback), in order.
services:
  - {app}

commands:
  precheck: "df -h /srv && git -C /srv/{app} status"
  sync: "git -C /srv/{app} fetch && git -C /srv/{app} checkout {{branch}}"
  build: "cd /srv/{app} && make install"
  migrate_plan: "cd /srv/{app} && make migrate-plan"
  migrate: "cd /srv/{app} && make migrate"
  # restart: "sudo systemctl restart {{service}}"
  # status: "systemctl is-active {{service}}"

backup:
  # abort (default): a failed backup stops the run before anything changes.
  # continue: only honored together with --force; the run is marked degraded.
  on_failure: abort
  create:
    database: "/opt/{app}/bin/backup-db"
    code: "/opt/{app}/bin/backup-code"
    config: "/opt/{app}/bin/backup-config"
  restore:
    database: "/opt/{app}/bin/restore-db {{ref}}"
    code: "/opt/{app}/bin/restore-code {{ref}}"
    config: "/opt/{app}/bin/restore-config {{ref}}"

checks:
  - name: http
    command: "curl -fsS http://localhost:8080/health"
    on_failure: critical
  - name: disk
    command: "test $(df --output=pcent /srv | tail -1 | tr -dc 0-9) -lt 90"
    on_failure: warn

verify:
  strict: false
  concurrency: 4
  budget: 3m

# Optional: post run outcomes to a webhook. Delivery uses the local `curl`
# binary, which must be on PATH.
# notify:
#   channel: "#deploys"
#   webhook:
#     env: LOCKSTEP_WEBHOOK_URL
"##,
        app = config.app,
        host = config.target.host,
        port = config.target.port,
        user = config.target.user.as_deref().unwrap_or("deploy"),
        branch = config.branch,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_yaml_round_trips_through_parser() {
        let yaml = generate_template_yaml(&Config::template());
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.app, "my-app");
        assert_eq!(parsed.checks.len(), 2);
        assert_eq!(parsed.required_snapshot_kinds().len(), 3);
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        init_config(dir.path(), Some("shop"), false).unwrap();
        assert!(matches!(
            init_config(dir.path(), Some("shop"), false),
            Err(Error::AlreadyExists(_))
        ));
        init_config(dir.path(), Some("shop"), true).unwrap();

        let written = Config::discover(dir.path()).unwrap();
        assert_eq!(written.app, "shop");
    }
}
