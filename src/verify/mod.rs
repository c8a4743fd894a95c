// ABOUTME: Health verifier: runs independent checks with per-check retry.
// ABOUTME: Checks run concurrently in a bounded pool under an overall budget.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{CheckConfig, FailureGrade};
use crate::remote::{Executor, RemoteCommand};

/// Final severity of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    Pass,
    Warn,
    Fail,
    Critical,
}

impl FailureGrade {
    fn severity(self) -> CheckSeverity {
        match self {
            FailureGrade::Warn => CheckSeverity::Warn,
            FailureGrade::Fail => CheckSeverity::Fail,
            FailureGrade::Critical => CheckSeverity::Critical,
        }
    }
}

/// Outcome of one check after retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub severity: CheckSeverity,
    /// Latency of the deciding attempt.
    pub latency_ms: u64,
    pub retries_used: u32,
    pub message: String,
}

/// Aggregated verdict over all checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    /// Warnings only; never blocks the run.
    Degraded,
    /// Blocking failure (strict mode turned a `fail` into this).
    Unhealthy,
    /// A critical check failed; roll back immediately.
    RollbackNow,
}

impl Verdict {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Verdict::Unhealthy | Verdict::RollbackNow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub results: Vec<HealthCheckResult>,
    pub verdict: Verdict,
}

impl VerificationReport {
    /// Aggregation rule: any critical -> RollbackNow; any fail -> blocking
    /// only when strict, otherwise a warning; warn never blocks.
    pub fn aggregate(results: Vec<HealthCheckResult>, strict: bool) -> Self {
        let mut verdict = Verdict::Healthy;
        for result in &results {
            let candidate = match result.severity {
                CheckSeverity::Pass => Verdict::Healthy,
                CheckSeverity::Warn => Verdict::Degraded,
                CheckSeverity::Fail => {
                    if strict {
                        Verdict::Unhealthy
                    } else {
                        Verdict::Degraded
                    }
                }
                CheckSeverity::Critical => Verdict::RollbackNow,
            };
            if rank(candidate) > rank(verdict) {
                verdict = candidate;
            }
        }
        Self { results, verdict }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.results
            .iter()
            .filter(|r| r.severity != CheckSeverity::Pass)
    }
}

fn rank(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Healthy => 0,
        Verdict::Degraded => 1,
        Verdict::Unhealthy => 2,
        Verdict::RollbackNow => 3,
    }
}

/// Run all checks and aggregate a verdict.
///
/// Checks are read-only and independent, so they run concurrently in a pool
/// of `concurrency` workers. Each attempt runs under the check's own timeout;
/// the whole battery runs under `budget`. A check the budget cuts off is
/// graded as if it had exhausted its retries.
pub async fn verify(
    executor: Arc<dyn Executor>,
    checks: &[CheckConfig],
    strict: bool,
    concurrency: usize,
    budget: Duration,
) -> VerificationReport {
    let deadline = tokio::time::Instant::now() + budget;

    let stream = futures::stream::iter(checks.iter().cloned().map(|check| {
        let executor = Arc::clone(&executor);
        async move { run_check(executor, check).await }
    }))
    .buffer_unordered(concurrency.max(1));
    let mut stream = std::pin::pin!(stream);

    let mut results: Vec<HealthCheckResult> = Vec::with_capacity(checks.len());
    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(result)) => results.push(result),
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("verification budget of {budget:?} exhausted");
                for check in checks {
                    if !results.iter().any(|r| r.name == check.name) {
                        results.push(HealthCheckResult {
                            name: check.name.clone(),
                            severity: check.on_failure.severity(),
                            latency_ms: 0,
                            retries_used: 0,
                            message: "not completed within verification budget".to_string(),
                        });
                    }
                }
                break;
            }
        }
    }

    VerificationReport::aggregate(results, strict)
}

/// Run one check with per-attempt timeout and bounded retries.
async fn run_check(executor: Arc<dyn Executor>, check: CheckConfig) -> HealthCheckResult {
    let command = RemoteCommand::new(&check.command).timeout(check.timeout);
    let mut last_message = String::new();

    for attempt in 0..=check.max_retries {
        if attempt > 0 {
            tokio::time::sleep(check.retry_delay).await;
        }

        let start = Instant::now();
        let latency_ms = |start: Instant| start.elapsed().as_millis() as u64;

        match executor.run(&command).await {
            Ok(output) if output.success() => {
                return HealthCheckResult {
                    name: check.name,
                    severity: CheckSeverity::Pass,
                    latency_ms: latency_ms(start),
                    retries_used: attempt,
                    message: "ok".to_string(),
                };
            }
            Ok(output) => {
                last_message = if output.stderr.trim().is_empty() {
                    format!("exited {}", output.exit_code)
                } else {
                    output.stderr.trim().to_string()
                };
                tracing::debug!(
                    check = %check.name,
                    attempt,
                    "health check attempt failed: {last_message}"
                );
            }
            Err(e) => {
                last_message = e.to_string();
                tracing::debug!(check = %check.name, attempt, "health check unreachable: {e}");
            }
        }

        if attempt == check.max_retries {
            return HealthCheckResult {
                name: check.name,
                severity: check.on_failure.severity(),
                latency_ms: latency_ms(start),
                retries_used: attempt,
                message: last_message,
            };
        }
    }

    unreachable!("retry loop always returns")
}

/// The minimal subset re-run after a rollback: critical checks, or the first
/// check when none are graded critical.
pub fn minimal_subset(checks: &[CheckConfig]) -> Vec<CheckConfig> {
    let critical: Vec<_> = checks
        .iter()
        .filter(|c| c.on_failure == FailureGrade::Critical)
        .cloned()
        .collect();
    if !critical.is_empty() {
        return critical;
    }
    checks.first().cloned().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ConnectivityError, DryRunExecutor, ExecOutput};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Executor that fails a fixed number of times per command, then passes.
    struct FlakyExecutor {
        failures_remaining: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl FlakyExecutor {
        fn failing_first(n: u32) -> Self {
            Self {
                failures_remaining: Mutex::new(n),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Executor for FlakyExecutor {
        async fn run(&self, _command: &RemoteCommand) -> Result<ExecOutput, ConnectivityError> {
            *self.calls.lock() += 1;
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(ExecOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "connection refused".to_string(),
                });
            }
            Ok(ExecOutput::simulated())
        }

        fn target(&self) -> String {
            "flaky".to_string()
        }
    }

    fn check(name: &str, grade: FailureGrade, max_retries: u32) -> CheckConfig {
        serde_yaml::from_str::<CheckConfig>(&format!(
            "name: {name}\ncommand: true\nmax_retries: {max_retries}\nretry_delay: 1ms\ntimeout: 1s\n"
        ))
        .map(|mut c| {
            c.on_failure = grade;
            c
        })
        .unwrap()
    }

    #[tokio::test]
    async fn check_that_eventually_passes_is_a_pass() {
        let executor = Arc::new(FlakyExecutor::failing_first(2));
        let checks = vec![check("http", FailureGrade::Critical, 3)];

        let report = verify(executor, &checks, true, 4, Duration::from_secs(5)).await;
        assert_eq!(report.verdict, Verdict::Healthy);
        assert_eq!(report.results[0].severity, CheckSeverity::Pass);
        assert_eq!(report.results[0].retries_used, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_take_the_configured_grade() {
        let executor = Arc::new(FlakyExecutor::failing_first(100));
        let checks = vec![check("http", FailureGrade::Fail, 2)];

        let report = verify(Arc::clone(&executor) as _, &checks, false, 4, Duration::from_secs(5)).await;
        assert_eq!(report.results[0].severity, CheckSeverity::Fail);
        assert_eq!(report.results[0].retries_used, 2);
        // 1 initial + 2 retries
        assert_eq!(*executor.calls.lock(), 3);
        // Non-strict: a fail degrades but does not block.
        assert_eq!(report.verdict, Verdict::Degraded);
    }

    #[tokio::test]
    async fn strict_mode_turns_fail_into_blocking() {
        let executor = Arc::new(FlakyExecutor::failing_first(100));
        let checks = vec![check("http", FailureGrade::Fail, 0)];

        let report = verify(executor, &checks, true, 4, Duration::from_secs(5)).await;
        assert_eq!(report.verdict, Verdict::Unhealthy);
        assert!(report.verdict.is_blocking());
    }

    #[tokio::test]
    async fn critical_failure_demands_rollback_even_without_strict() {
        let executor = Arc::new(FlakyExecutor::failing_first(100));
        let checks = vec![
            check("disk", FailureGrade::Warn, 0),
            check("http", FailureGrade::Critical, 0),
        ];

        let report = verify(executor, &checks, false, 4, Duration::from_secs(5)).await;
        assert_eq!(report.verdict, Verdict::RollbackNow);
    }

    #[tokio::test]
    async fn warn_never_blocks() {
        let executor = Arc::new(FlakyExecutor::failing_first(100));
        let checks = vec![check("disk", FailureGrade::Warn, 0)];

        let report = verify(executor, &checks, true, 4, Duration::from_secs(5)).await;
        assert_eq!(report.verdict, Verdict::Degraded);
        assert!(!report.verdict.is_blocking());
        assert_eq!(report.warnings().count(), 1);
    }

    #[tokio::test]
    async fn all_healthy_checks_report_healthy() {
        let executor = Arc::new(DryRunExecutor::new());
        let checks = vec![
            check("http", FailureGrade::Critical, 1),
            check("db", FailureGrade::Fail, 1),
        ];

        let report = verify(executor, &checks, true, 2, Duration::from_secs(5)).await;
        assert_eq!(report.verdict, Verdict::Healthy);
        assert_eq!(report.results.len(), 2);
    }

    #[test]
    fn minimal_subset_prefers_critical_checks() {
        let checks = vec![
            check("disk", FailureGrade::Warn, 0),
            check("http", FailureGrade::Critical, 0),
        ];
        let subset = minimal_subset(&checks);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].name, "http");

        let no_critical = vec![check("disk", FailureGrade::Warn, 0)];
        let subset = minimal_subset(&no_critical);
        assert_eq!(subset[0].name, "disk");
    }
}
