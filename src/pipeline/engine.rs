// ABOUTME: The phase pipeline engine: drives phases in order against collaborators.
// ABOUTME: Owns lock acquisition, failure classification, rollback handoff, and reporting.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::config::Config;
use crate::diagnostics::{Diagnostics, Warning};
use crate::error::Error;
use crate::output::Output;
use crate::remote::{Executor, RemoteCommand};
use crate::report::{IncidentRecord, PhaseLogEntry, Reporter};
use crate::rollback::run_rollback;
use crate::services::{
    Builder, CodeSync, Migrator, Notifier, Prechecker, RemoteCommands, ServiceManager,
    ServiceStatus, WebhookNotifier,
};
use crate::snapshot::{BackupService, CommandBackupService, SnapshotContext, SnapshotKind};
use crate::verify;

use super::error::{FailureAction, PhaseError, classify};
use super::lock::{DeployLock, LockError};
use super::phase::{PhaseName, PhaseSpec, PhaseStatus, standard_phases};
use super::run::{DeploymentRun, RunMode, RunState};

/// Per-invocation options, mostly from the CLI.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub environment: String,
    pub branch: Option<String>,
    pub mode: RunMode,
    /// Break held locks; with a `continue` backup policy, also run past
    /// failed backups.
    pub force: bool,
    /// Override the configured strict setting for verification.
    pub strict: Option<bool>,
    pub skip: Vec<PhaseName>,
    pub notify_channel: Option<String>,
}

impl EngineOptions {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            branch: None,
            mode: RunMode::Live,
            force: false,
            strict: None,
            skip: Vec::new(),
            notify_channel: None,
        }
    }
}

/// The external capabilities the pipeline sequences.
pub struct Collaborators {
    pub executor: Arc<dyn Executor>,
    pub backup: Arc<dyn BackupService>,
    pub prechecker: Arc<dyn Prechecker>,
    pub code_sync: Arc<dyn CodeSync>,
    pub builder: Arc<dyn Builder>,
    pub migrator: Arc<dyn Migrator>,
    pub service_manager: Arc<dyn ServiceManager>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Collaborators {
    /// Wire every collaborator to configured shell commands over `executor`.
    pub fn command_backed(
        executor: Arc<dyn Executor>,
        config: &Config,
        simulated: bool,
    ) -> Result<Self, Error> {
        let env = crate::config::resolve_env_map(&config.env)?;
        let remote = Arc::new(RemoteCommands::new(
            Arc::clone(&executor),
            config.commands.clone(),
            env,
            config.remote.command_timeout,
        ));
        let backup = Arc::new(CommandBackupService::new(
            Arc::clone(&executor),
            config.backup.clone(),
            config.remote.command_timeout,
            simulated,
        ));

        let notifier: Option<Arc<dyn Notifier>> = match &config.notify {
            Some(notify) => match &notify.webhook {
                Some(webhook) => Some(Arc::new(WebhookNotifier::new(webhook.resolve()?))),
                None => None,
            },
            None => None,
        };

        Ok(Self {
            executor,
            backup,
            prechecker: remote.clone(),
            code_sync: remote.clone(),
            builder: remote.clone(),
            migrator: remote.clone(),
            service_manager: remote,
            notifier,
        })
    }
}

/// Drives one DeploymentRun through the ordered phase list.
pub struct Engine {
    config: Config,
    collab: Collaborators,
    reporter: Reporter,
    output: Output,
    cancel: watch::Receiver<bool>,
    phases: Vec<PhaseSpec>,
}

impl Engine {
    pub fn new(
        config: Config,
        collab: Collaborators,
        reporter: Reporter,
        output: Output,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            collab,
            reporter,
            output,
            cancel,
            phases: standard_phases(),
        }
    }

    /// Replace the phase list. The order and tags are data, so tests and
    /// unusual pipelines can reshape the run without touching the engine.
    pub fn with_phases(mut self, phases: Vec<PhaseSpec>) -> Self {
        self.phases = phases;
        self
    }

    /// Execute a full deployment run.
    ///
    /// Pre-run failures (lock contention, connectivity) return `Err` and
    /// leave the target untouched. Once phases start, the run always reaches
    /// a terminal state and is returned for exit-code mapping.
    pub async fn run(&self, opts: EngineOptions) -> Result<DeploymentRun, Error> {
        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| self.config.branch.clone());
        let mut run = DeploymentRun::new(&opts.environment, &branch, opts.mode);
        let mut diagnostics = Diagnostics::default();

        // Exactly one active run per target: acquire before anything else.
        let lock = DeployLock::acquire(
            &self.config.state_dir(),
            &self.config.app,
            &opts.environment,
            opts.force,
        )
        .map_err(|e| match e {
            LockError::Held { holder, pid, .. } => Error::ConcurrentDeployment {
                environment: opts.environment.clone(),
                holder,
                pid,
            },
            LockError::Io(e) => Error::Io(e),
            LockError::Serialize(e) => Error::Io(std::io::Error::other(e)),
        })?;

        // Pre-run connectivity probe. In dry-run mode the executor
        // synthesizes success without contacting anything.
        if let Err(e) = self
            .collab
            .executor
            .run(&RemoteCommand::new("true").timeout(self.config.remote.command_timeout))
            .await
        {
            lock.release();
            return Err(Error::Connectivity(e));
        }

        let target = match opts.mode {
            RunMode::DryRun => "dry-run".to_string(),
            RunMode::Live => self.collab.executor.target(),
        };
        self.output.progress(&format!(
            "Deploying {} ({}) to {} [{}]",
            self.config.app, branch, opts.environment, target
        ));

        run.transition(RunState::Running)
            .expect("fresh run must accept Running");

        let mut restored_snapshots: Vec<String> = Vec::new();
        let phases = self.phases.clone();

        for (index, spec) in phases.iter().enumerate() {
            if let Some(reason) = self.skip_reason(spec, &opts) {
                run.phase_skipped(spec, index, &reason);
                self.output.phase_skipped(spec.name.as_str(), &reason);
                self.log_phase(&mut diagnostics, &run, spec.name, PhaseStatus::Skipped, 0, Some(reason));
                continue;
            }

            run.phase_started(spec, index);
            self.output.phase_running(spec.name.as_str());
            self.log_phase(&mut diagnostics, &run, spec.name, PhaseStatus::Running, 0, None);

            let start = Instant::now();
            let cancel = self.cancel.clone();
            let result = tokio::select! {
                biased;
                _ = cancelled(cancel) => Err(PhaseError::Aborted),
                result = self.execute_phase(spec, &mut run, &opts, &branch) => result,
            };
            let duration = start.elapsed();

            match result {
                Ok(message) => {
                    run.phase_finished(PhaseStatus::Success, duration, message.clone());
                    self.output.phase_ok(spec.name.as_str(), duration);
                    self.log_phase(
                        &mut diagnostics,
                        &run,
                        spec.name,
                        PhaseStatus::Success,
                        duration.as_millis() as u64,
                        message,
                    );
                }
                Err(error) => {
                    let detail = error.to_string();
                    run.phase_finished(PhaseStatus::Failed, duration, Some(detail.clone()));
                    self.output.phase_failed(spec.name.as_str(), &detail);
                    self.log_phase(
                        &mut diagnostics,
                        &run,
                        spec.name,
                        PhaseStatus::Failed,
                        duration.as_millis() as u64,
                        Some(detail.clone()),
                    );

                    match classify(spec.criticality, run.mutated) {
                        FailureAction::Continue => {
                            run.push_warning(format!(
                                "{} failed but is non-blocking: {detail}",
                                spec.name
                            ));
                        }
                        FailureAction::Abort => {
                            run.transition(RunState::Failed)
                                .expect("running run must accept Failed");
                            break;
                        }
                        FailureAction::Rollback => {
                            self.output.progress("  → Rolling back...");
                            let report = run_rollback(
                                &run,
                                self.collab.backup.as_ref(),
                                self.collab.service_manager.as_ref(),
                                Arc::clone(&self.collab.executor),
                                &self.config.checks,
                                &self.restart_order(),
                            )
                            .await;
                            restored_snapshots = report.restored;

                            let next = match report.resolution {
                                crate::report::Resolution::RolledBack => RunState::RolledBack,
                                crate::report::Resolution::ManualInterventionRequired => {
                                    RunState::ManualInterventionRequired
                                }
                            };
                            run.transition(next)
                                .expect("running run must accept rollback outcome");
                            break;
                        }
                    }
                }
            }
        }

        if !run.state.is_terminal() {
            run.transition(RunState::Succeeded)
                .expect("running run must accept Succeeded");
        }

        // The reporter always records the outcome; its failures never
        // escalate into run failure.
        let incident = match run.state {
            RunState::RolledBack | RunState::ManualInterventionRequired => Some(
                IncidentRecord::from_run(&run, std::mem::take(&mut restored_snapshots)),
            ),
            _ => None,
        };
        if !self.reporter.record(&run, incident.as_ref()) {
            diagnostics.warn(Warning::report_write(format!(
                "run record for {} may be incomplete",
                run.id
            )));
        }

        self.notify_outcome(&run, &opts, &mut diagnostics).await;

        self.output.summary(&run);
        if matches!(
            run.state,
            RunState::RolledBack | RunState::ManualInterventionRequired
        ) {
            self.output.rollback_banner(&run);
        }
        for warning in diagnostics.warnings() {
            self.output.warn(&warning.message);
        }

        lock.release();
        Ok(run)
    }

    /// Why a phase will not run, if any skip condition applies.
    fn skip_reason(&self, spec: &PhaseSpec, opts: &EngineOptions) -> Option<String> {
        if spec.skippable_by_flag() && opts.skip.contains(&spec.name) {
            return Some("disabled by --skip".to_string());
        }
        if !spec.skippable_when_unconfigured() {
            return None;
        }
        match spec.name {
            PhaseName::Backup if self.kinds_to_snapshot(opts).is_empty() => {
                Some("no mutating phases configured".to_string())
            }
            PhaseName::Sync if self.config.commands.sync.is_none() => {
                Some("no sync command configured".to_string())
            }
            PhaseName::Build if self.config.commands.build.is_none() => {
                Some("no build command configured".to_string())
            }
            PhaseName::Migrate if self.config.commands.migrate.is_none() => {
                Some("no migrate command configured".to_string())
            }
            PhaseName::Verify if self.config.checks.is_empty() => {
                Some("no checks configured".to_string())
            }
            _ => None,
        }
    }

    /// Snapshot kinds the backup phase must create: one per mutating phase
    /// that will actually run.
    fn kinds_to_snapshot(&self, opts: &EngineOptions) -> Vec<SnapshotKind> {
        self.config
            .required_snapshot_kinds()
            .into_iter()
            .filter(|kind| !opts.skip.contains(&kind.protected_phase()))
            .collect()
    }

    fn restart_order(&self) -> Vec<String> {
        self.config.services.iter().cloned().collect()
    }

    async fn execute_phase(
        &self,
        spec: &PhaseSpec,
        run: &mut DeploymentRun,
        opts: &EngineOptions,
        branch: &str,
    ) -> Result<Option<String>, PhaseError> {
        // A mutating phase must be preceded by its snapshot, unless the run
        // was explicitly degraded past a failed backup.
        if let Some(kind) = spec.snapshot {
            if !run.snapshots.has_kind(kind) && !run.degraded {
                return Err(PhaseError::MissingSnapshot {
                    kind,
                    phase: spec.name,
                });
            }
            run.mark_mutated();
        }

        match spec.name {
            PhaseName::Precheck => {
                self.collab.prechecker.precheck().await?;
                Ok(None)
            }
            PhaseName::Backup => self.execute_backup(run, opts).await,
            PhaseName::Sync => {
                self.collab.code_sync.sync(branch).await?;
                Ok(Some(format!("checked out {branch}")))
            }
            PhaseName::Build => {
                self.collab.builder.build().await?;
                Ok(None)
            }
            PhaseName::Migrate => {
                let plan = self.collab.migrator.plan().await?;
                if !plan.is_empty() {
                    self.output
                        .progress(&format!("    {} migration(s) pending", plan.len()));
                }
                self.collab
                    .migrator
                    .apply()
                    .await
                    .map_err(PhaseError::Migration)?;
                Ok(Some(format!("applied {} migration(s)", plan.len())))
            }
            PhaseName::Restart => {
                for name in self.restart_order() {
                    self.collab.service_manager.restart(&name).await?;
                    if self.collab.service_manager.status(&name).await?
                        == ServiceStatus::Stopped
                    {
                        return Err(PhaseError::ServiceNotRunning { name });
                    }
                }
                Ok(Some(format!(
                    "restarted {} service(s)",
                    self.config.services.len()
                )))
            }
            PhaseName::Verify => {
                let strict = opts.strict.unwrap_or(self.config.verify.strict);
                let report = verify::verify(
                    Arc::clone(&self.collab.executor),
                    &self.config.checks,
                    strict,
                    self.config.verify.concurrency,
                    self.config.verify.budget,
                )
                .await;

                for result in report.warnings() {
                    run.push_warning(format!(
                        "check {} reported {:?}: {}",
                        result.name, result.severity, result.message
                    ));
                }
                let verdict = report.verdict;
                let checks_run = report.results.len();
                run.verification = Some(report);

                if verdict.is_blocking() {
                    return Err(PhaseError::Verification { verdict });
                }
                Ok(Some(format!("{checks_run} check(s), verdict {verdict:?}")))
            }
        }
    }

    /// Create one snapshot per kind a later mutating phase needs.
    ///
    /// On failure: abort by default; continue degraded only when the policy
    /// allows it and `--force` was given.
    async fn execute_backup(
        &self,
        run: &mut DeploymentRun,
        opts: &EngineOptions,
    ) -> Result<Option<String>, PhaseError> {
        let continue_on_failure = opts.force
            && self.config.backup.on_failure == crate::config::BackupFailurePolicy::Continue;

        let kinds = self.kinds_to_snapshot(opts);
        let mut created = 0usize;
        for kind in kinds {
            let ctx = SnapshotContext {
                run_id: run.id.clone(),
                app: self.config.app.clone(),
                phase: kind.protected_phase(),
            };
            match self.collab.backup.create_backup(kind, &ctx).await {
                Ok(snapshot) => {
                    self.output.progress(&format!(
                        "    {} snapshot {} -> {}",
                        kind, snapshot.id, snapshot.storage_ref
                    ));
                    run.record_snapshot(snapshot);
                    created += 1;
                }
                Err(e) if continue_on_failure => {
                    run.mark_degraded(format!(
                        "continuing without {kind} snapshot (--force): {e}"
                    ));
                }
                Err(e) => return Err(PhaseError::Backup(e)),
            }
        }
        Ok(Some(format!("{created} snapshot(s) created")))
    }

    async fn notify_outcome(
        &self,
        run: &DeploymentRun,
        opts: &EngineOptions,
        diagnostics: &mut Diagnostics,
    ) {
        let Some(notifier) = &self.collab.notifier else {
            return;
        };
        let channel = opts
            .notify_channel
            .clone()
            .or_else(|| self.config.notify.as_ref().map(|n| n.channel.clone()));
        let Some(channel) = channel else {
            return;
        };

        let message = format!(
            "{} deploy {} on {}: {}",
            self.config.app, run.id, run.environment, run.state
        );
        if let Err(e) = notifier.notify(&channel, &message).await {
            diagnostics.warn(Warning::notification(e.to_string()));
        }
    }

    fn log_phase(
        &self,
        diagnostics: &mut Diagnostics,
        run: &DeploymentRun,
        phase: PhaseName,
        status: PhaseStatus,
        duration_ms: u64,
        message: Option<String>,
    ) {
        let entry = PhaseLogEntry {
            run_id: run.id.clone(),
            timestamp: Utc::now(),
            phase,
            status,
            duration_ms,
            message,
        };
        if !self.reporter.log_phase(&entry) {
            // One diagnostic per run is enough; every miss is traced anyway.
            let already_warned = diagnostics
                .warnings()
                .iter()
                .any(|w| w.kind == crate::diagnostics::WarningKind::ReportWrite);
            if !already_warned {
                diagnostics.warn(Warning::report_write(format!(
                    "run log for {} may be incomplete",
                    run.id
                )));
            }
        }
    }
}

/// Resolves when cancellation is requested; never resolves otherwise.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can no longer be requested.
            std::future::pending::<()>().await;
        }
    }
}
