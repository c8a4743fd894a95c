// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};

use lockstep::pipeline::{PhaseName, standard_phases};

/// Accepts only the phases the pipeline allows `--skip` for; precheck and
/// backup always run.
fn skippable_phase(s: &str) -> Result<PhaseName, String> {
    let phase: PhaseName = s.parse()?;
    let allowed = standard_phases()
        .iter()
        .any(|spec| spec.name == phase && spec.skippable_by_flag());
    if allowed {
        Ok(phase)
    } else {
        Err(format!("phase {phase} cannot be skipped"))
    }
}

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(about = "Phased deployment with snapshots, health checks, and automatic rollback")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print the final result
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Emit JSON lines instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new lockstep.yml configuration file
    Init {
        /// Application name to put in the template
        #[arg(short, long)]
        app: Option<String>,

        /// Overwrite an existing configuration file
        #[arg(short, long)]
        force: bool,
    },

    /// Run the deployment pipeline against a target environment
    Deploy {
        /// Target environment (defined in config)
        #[arg(short, long)]
        environment: Option<String>,

        /// Branch to deploy (overrides the configured branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Walk the pipeline without contacting the target
        #[arg(long)]
        dry_run: bool,

        /// Break a held deploy lock; with a `continue` backup policy, also
        /// run past failed backups
        #[arg(short, long)]
        force: bool,

        /// Skip a phase (repeatable): sync, build, migrate, restart, verify
        #[arg(long, value_name = "PHASE", value_parser = skippable_phase)]
        skip: Vec<PhaseName>,

        /// Treat failed health checks as blocking
        #[arg(long)]
        strict: bool,

        /// Notification channel for the run outcome
        #[arg(long, value_name = "CHANNEL")]
        notify: Option<String>,
    },

    /// Restore the target from a recorded run's snapshots
    Rollback {
        /// Target environment (defined in config)
        #[arg(short, long)]
        environment: Option<String>,

        /// Run to restore from (default: the environment's last run)
        #[arg(long, value_name = "RUN_ID")]
        run: Option<String>,
    },

    /// Show the last run and current lock state
    Status {
        /// Target environment (defined in config)
        #[arg(short, long)]
        environment: Option<String>,
    },
}
