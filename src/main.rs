// ABOUTME: Entry point for the lockstep CLI application.
// ABOUTME: Parses arguments, wires collaborators, and maps outcomes to exit codes.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use lockstep::config::{Config, init_config};
use lockstep::error::{Error, Result};
use lockstep::output::{Output, OutputMode};
use lockstep::pipeline::{Collaborators, Engine, EngineOptions, LockInfo, RunMode, RunState};
use lockstep::remote::{DryRunExecutor, Executor, RetryPolicy, SshExecutor, TargetAddress};
use lockstep::report::{Reporter, Resolution};
use lockstep::rollback::run_rollback;
use std::env;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let output = Output::new(if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    });

    match run(cli, &output).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            output.error(&e.to_string());
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli, output: &Output) -> Result<i32> {
    match cli.command {
        Commands::Init { app, force } => {
            let cwd = env::current_dir()?;
            init_config(&cwd, app.as_deref(), force)?;
            output.progress("Wrote lockstep.yml");
            Ok(0)
        }
        Commands::Deploy {
            environment,
            branch,
            dry_run,
            force,
            skip,
            strict,
            notify,
        } => {
            let (config, environment) = load_config(environment.as_deref())?;

            let mode = if dry_run {
                RunMode::DryRun
            } else {
                RunMode::Live
            };
            let executor = build_executor(&config, mode);
            let collab = Collaborators::command_backed(Arc::clone(&executor), &config, dry_run)?;
            let reporter = Reporter::new(config.state_dir());

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = cancel_tx.send(true);
                }
            });

            let engine = Engine::new(config, collab, reporter, output.clone(), cancel_rx);

            let mut opts = EngineOptions::new(environment);
            opts.branch = branch;
            opts.mode = mode;
            opts.force = force;
            opts.strict = strict.then_some(true);
            opts.skip = skip;
            opts.notify_channel = notify;

            let run = engine.run(opts).await?;
            match run.state {
                RunState::Succeeded => Ok(0),
                RunState::RolledBack => Err(Error::RolledBack),
                RunState::ManualInterventionRequired => Err(Error::ManualInterventionRequired),
                _ => Err(Error::Failed),
            }
        }
        Commands::Rollback { environment, run } => {
            let (config, environment) = load_config(environment.as_deref())?;
            manual_rollback(config, &environment, run.as_deref(), output).await
        }
        Commands::Status { environment } => {
            let (config, environment) = load_config(environment.as_deref())?;
            status(config, &environment, output);
            Ok(0)
        }
    }
}

/// Discover the config and apply environment overrides.
///
/// Without `--environment` the base config drives a run against the
/// implicit "default" environment.
fn load_config(environment: Option<&str>) -> Result<(Config, String)> {
    let cwd = env::current_dir()?;
    let config = Config::discover(&cwd)?;
    match environment {
        Some(name) => Ok((config.for_environment(name)?, name.to_string())),
        None => Ok((config, "default".to_string())),
    }
}

fn build_executor(config: &Config, mode: RunMode) -> Arc<dyn Executor> {
    if mode.is_dry_run() {
        return Arc::new(DryRunExecutor::new());
    }

    let mut address = TargetAddress::new(&config.target.host, config.target.effective_user())
        .port(config.target.port)
        .trust_on_first_use(config.target.trust_first_connection);
    if let Some(ref key_path) = config.target.key_path {
        address = address.key_path(key_path);
    }

    Arc::new(SshExecutor::new(
        address,
        RetryPolicy {
            max_attempts: config.remote.max_attempts,
            delay: config.remote.retry_delay,
        },
    ))
}

/// Operator-initiated rollback from a recorded run.
async fn manual_rollback(
    config: Config,
    environment: &str,
    run_id: Option<&str>,
    output: &Output,
) -> Result<i32> {
    let reporter = Reporter::new(config.state_dir());
    let last = match run_id {
        Some(id) => reporter
            .load_run(id)
            .ok_or_else(|| Error::NoRunHistory(id.to_string()))?,
        None => reporter
            .last_run(environment)
            .ok_or_else(|| Error::NoRunHistory(environment.to_string()))?,
    };

    if last.snapshots.iter().all(|s| s.simulated) {
        return Err(Error::NoRunHistory(format!(
            "{environment} (last run {} has no restorable snapshots)",
            last.id
        )));
    }

    output.progress(&format!(
        "Rolling back {} from run {} ({} snapshot(s))",
        config.app,
        last.id,
        last.snapshots.len()
    ));

    let executor = build_executor(&config, RunMode::Live);
    let collab = Collaborators::command_backed(Arc::clone(&executor), &config, false)?;
    let services: Vec<String> = config.services.iter().cloned().collect();

    let report = run_rollback(
        &last,
        collab.backup.as_ref(),
        collab.service_manager.as_ref(),
        executor,
        &config.checks,
        &services,
    )
    .await;

    for id in &report.restored {
        output.progress(&format!("  ✓ restored {id}"));
    }

    match report.resolution {
        Resolution::RolledBack => {
            output.progress("Rollback complete");
            Ok(0)
        }
        Resolution::ManualInterventionRequired => Err(Error::ManualInterventionRequired),
    }
}

fn status(config: Config, environment: &str, output: &Output) {
    let state_dir = config.state_dir();
    let reporter = Reporter::new(&state_dir);

    let lock_path = LockInfo::lock_path(&state_dir, environment);
    match std::fs::read_to_string(&lock_path)
        .ok()
        .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok())
    {
        Some(info) => output.progress(&format!(
            "Lock: held by {} (pid {}) since {}",
            info.holder, info.pid, info.acquired_at
        )),
        None => output.progress("Lock: free"),
    }

    match reporter.last_run(environment) {
        Some(run) => output.summary(&run),
        None => output.progress(&format!("No recorded runs for {environment}")),
    }
}
