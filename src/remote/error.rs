// ABOUTME: Connectivity error types with SNAFU pattern.
// ABOUTME: Classifies failures as transient (retryable) or fatal for retry policy.

use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;

/// Failure to reach or authenticate against the target environment.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnectivityError {
    #[snafu(display("connection to {host}:{port} failed: {reason}"))]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[snafu(display("authentication failed for {user}@{host}: no valid credentials"))]
    Authentication { user: String, host: String },

    #[snafu(display("failed to load key from {path:?}: {reason}"))]
    KeyLoad { path: PathBuf, reason: String },

    #[snafu(display("SSH agent not available: {reason}"))]
    AgentUnavailable { reason: String },

    #[snafu(display("command timed out after {timeout:?}"))]
    CommandTimeout { timeout: Duration },

    #[snafu(display("channel closed unexpectedly without exit status"))]
    ChannelClosed,

    #[snafu(display("SSH protocol error: {source}"))]
    Protocol { source: russh::Error },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityErrorKind {
    /// Worth retrying with backoff (network blips, dropped channels).
    Transient,
    /// Retrying cannot help (bad credentials, missing keys, protocol errors).
    Fatal,
}

impl ConnectivityError {
    /// Returns the error kind for retry decisions.
    ///
    /// Command timeouts are fatal on purpose: re-running a command that may
    /// have partially executed is not safe at this layer.
    pub fn kind(&self) -> ConnectivityErrorKind {
        match self {
            ConnectivityError::Connection { .. } | ConnectivityError::ChannelClosed => {
                ConnectivityErrorKind::Transient
            }
            ConnectivityError::Authentication { .. }
            | ConnectivityError::KeyLoad { .. }
            | ConnectivityError::AgentUnavailable { .. }
            | ConnectivityError::CommandTimeout { .. }
            | ConnectivityError::Protocol { .. } => ConnectivityErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ConnectivityErrorKind::Transient
    }
}
