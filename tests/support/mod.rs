// ABOUTME: Shared test support: a scripted executor and config builders.
// ABOUTME: Used by the pipeline and rollback integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use lockstep::config::Config;
use lockstep::output::{Output, OutputMode};
use lockstep::pipeline::{Collaborators, Engine};
use lockstep::remote::{ConnectivityError, ExecOutput, Executor, RemoteCommand};
use lockstep::report::Reporter;

enum Response {
    Exit {
        exit_code: u32,
        stdout: String,
        stderr: String,
    },
    Refuse,
}

struct Rule {
    pattern: String,
    /// None: fires every time. Some(n): fires for the next n matches.
    remaining: Option<u32>,
    response: Response,
}

/// Executor with canned per-command responses.
///
/// Commands are matched by substring against configured rules, first match
/// wins; everything else succeeds with empty output. Every command line is
/// recorded in execution order.
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    recorded: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Commands containing `pattern` exit 1.
    pub fn fail_matching(self, pattern: &str) -> Self {
        self.push_rule(pattern, None, Response::Exit {
            exit_code: 1,
            stdout: String::new(),
            stderr: format!("scripted failure for {pattern}"),
        })
    }

    /// The next `times` commands containing `pattern` exit 1, then pass.
    pub fn fail_matching_times(self, pattern: &str, times: u32) -> Self {
        self.push_rule(pattern, Some(times), Response::Exit {
            exit_code: 1,
            stdout: String::new(),
            stderr: format!("scripted failure for {pattern}"),
        })
    }

    /// Commands containing `pattern` fail with a connectivity error.
    pub fn refuse_matching(self, pattern: &str) -> Self {
        self.push_rule(pattern, None, Response::Refuse)
    }

    /// Commands containing `pattern` succeed with the given stdout.
    pub fn respond_matching(self, pattern: &str, stdout: &str) -> Self {
        self.push_rule(pattern, None, Response::Exit {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn push_rule(self, pattern: &str, remaining: Option<u32>, response: Response) -> Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            remaining,
            response,
        });
        self
    }

    pub fn recorded_commands(&self) -> Vec<String> {
        self.recorded.lock().clone()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.recorded
            .lock()
            .iter()
            .filter(|line| line.contains(pattern))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, command: &RemoteCommand) -> Result<ExecOutput, ConnectivityError> {
        self.recorded.lock().push(command.line.clone());

        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if !command.line.contains(&rule.pattern) {
                continue;
            }
            match rule.remaining {
                Some(0) => continue,
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            return match &rule.response {
                Response::Exit {
                    exit_code,
                    stdout,
                    stderr,
                } => Ok(ExecOutput {
                    exit_code: *exit_code,
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                }),
                Response::Refuse => Err(ConnectivityError::Connection {
                    host: "scripted".to_string(),
                    port: 22,
                    reason: "refused by script".to_string(),
                }),
            };
        }

        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn target(&self) -> String {
        "scripted".to_string()
    }
}

/// A config exercising every phase, with distinct command markers so the
/// scripted executor can target them individually.
pub fn full_config(state_dir: &Path) -> Config {
    let yaml = format!(
        r#"
app: shop
state_dir: {state_dir}
target:
  host: shop.example.com
  user: deploy
services:
  - shop-api
commands:
  precheck: "precheck-space"
  sync: "sync-code {{branch}}"
  build: "build-app"
  migrate_plan: "migrate-plan"
  migrate: "migrate-apply"
  restart: "restart-service {{service}}"
  status: "status-service {{service}}"
backup:
  on_failure: continue
  create:
    code: "backup-code"
    config: "backup-config"
    database: "backup-db"
  restore:
    code: "restore-code {{ref}}"
    config: "restore-config {{ref}}"
    database: "restore-db {{ref}}"
checks:
  - name: http
    command: "check-http"
    max_retries: 0
    retry_delay: 1ms
    timeout: 2s
    on_failure: critical
  - name: disk
    command: "check-disk"
    max_retries: 0
    retry_delay: 1ms
    timeout: 2s
    on_failure: warn
verify:
  strict: false
  concurrency: 2
  budget: 10s
"#,
        state_dir = state_dir.display()
    );
    Config::from_yaml(&yaml).unwrap()
}

/// Wire an engine over the given executor. The returned sender cancels the
/// run when set to true.
pub fn build_engine(
    config: Config,
    executor: Arc<dyn Executor>,
    simulated: bool,
) -> (Engine, watch::Sender<bool>) {
    let collab = Collaborators::command_backed(Arc::clone(&executor), &config, simulated).unwrap();
    let reporter = Reporter::new(config.state_dir());
    let (tx, rx) = watch::channel(false);
    let engine = Engine::new(config, collab, reporter, Output::new(OutputMode::Quiet), rx);
    (engine, tx)
}
