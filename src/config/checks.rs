// ABOUTME: Health check configuration for the verification phase.
// ABOUTME: Defines per-check retry, timeout, and failure severity parameters.

use serde::Deserialize;
use std::time::Duration;

/// How a check's final failure is graded during aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureGrade {
    /// Never blocks the run.
    Warn,
    /// Blocks only in strict mode.
    #[default]
    Fail,
    /// Always triggers a rollback recommendation.
    Critical,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckConfig {
    pub name: String,

    /// Read-only command run on the target; exit 0 means healthy.
    pub command: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub on_failure: FailureGrade,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Settings for the verification phase as a whole.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Treat `fail`-graded checks as blocking.
    #[serde(default)]
    pub strict: bool,

    /// Bounded worker pool size for concurrent checks.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Overall wall-clock budget for the verification phase.
    #[serde(default = "default_budget", with = "humantime_serde")]
    pub budget: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            strict: false,
            concurrency: default_concurrency(),
            budget: default_budget(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_budget() -> Duration {
    Duration::from_secs(180)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_defaults_from_yaml() {
        let check: CheckConfig = serde_yaml::from_str(
            r#"
name: http
command: curl -fsS http://localhost:8080/health
"#,
        )
        .unwrap();

        assert_eq!(check.max_retries, 3);
        assert_eq!(check.retry_delay, Duration::from_secs(5));
        assert_eq!(check.timeout, Duration::from_secs(10));
        assert_eq!(check.on_failure, FailureGrade::Fail);
    }

    #[test]
    fn humantime_durations_parse() {
        let check: CheckConfig = serde_yaml::from_str(
            r#"
name: db
command: pg_isready
retry_delay: 2s
timeout: 30s
on_failure: critical
"#,
        )
        .unwrap();

        assert_eq!(check.retry_delay, Duration::from_secs(2));
        assert_eq!(check.timeout, Duration::from_secs(30));
        assert_eq!(check.on_failure, FailureGrade::Critical);
    }
}
