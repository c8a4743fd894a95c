// ABOUTME: SSH-backed executor using russh.
// ABOUTME: Handles connection, authentication, host key checks, and bounded retry.

use super::error::ConnectivityError;
use super::{ExecOutput, Executor, RemoteCommand};
use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key, ssh_key};
use russh::ChannelMsg;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

/// Address and credentials for the deployment target.
#[derive(Debug, Clone)]
pub struct TargetAddress {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// Optional path to private key file.
    /// If None, will try SSH agent then default key locations.
    pub key_path: Option<PathBuf>,
    /// Whether to accept unknown hosts (Trust On First Use).
    pub trust_on_first_use: bool,
    /// Optional path to known_hosts file.
    pub known_hosts_path: Option<PathBuf>,
}

impl TargetAddress {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_path: None,
            trust_on_first_use: false,
            known_hosts_path: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn trust_on_first_use(mut self, tofu: bool) -> Self {
        self.trust_on_first_use = tofu;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }
}

/// Bounded retry with fixed backoff for transient connection failures.
///
/// Only connectivity failures are retried. A non-zero exit code from the
/// remote command is a phase-level failure and is never retried here.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
    known_hosts_path: Option<PathBuf>,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let check_result = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match check_result {
            Ok(true) => Ok(true),
            Ok(false) => {
                if self.trust_on_first_use {
                    tracing::warn!(
                        "Trust-On-First-Use: accepting unknown host key for {}:{}",
                        self.host,
                        self.port
                    );
                    let learn_result = match &self.known_hosts_path {
                        Some(path) => {
                            learn_known_hosts_path(&self.host, self.port, server_public_key, path)
                        }
                        None => learn_known_hosts(&self.host, self.port, server_public_key),
                    };
                    if let Err(e) = learn_result {
                        tracing::warn!("Failed to save host key to known_hosts: {}", e);
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(russh::keys::Error::KeyChanged { .. }) => Ok(false),
            Err(_) => Ok(self.trust_on_first_use),
        }
    }
}

/// Authentication method resolved from the target address.
enum AuthMethod {
    Agent(AgentClient<UnixStream>),
    KeyFile(Arc<ssh_key::PrivateKey>),
}

/// Executor that runs commands over a live SSH session.
///
/// The session is established lazily on first use and re-established after
/// transient failures, up to the retry policy's attempt budget.
pub struct SshExecutor {
    address: TargetAddress,
    retry: RetryPolicy,
    handle: Mutex<Option<Arc<Handle<SshHandler>>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("address", &self.address)
            .field("retry", &self.retry)
            .finish()
    }
}

impl SshExecutor {
    pub fn new(address: TargetAddress, retry: RetryPolicy) -> Self {
        Self {
            address,
            retry,
            handle: Mutex::new(None),
        }
    }

    /// Resolve which authentication method to use.
    async fn resolve_auth_method(address: &TargetAddress) -> Result<AuthMethod, ConnectivityError> {
        if let Some(key_path) = &address.key_path {
            let key =
                load_secret_key(key_path, None).map_err(|e| ConnectivityError::KeyLoad {
                    path: key_path.clone(),
                    reason: e.to_string(),
                })?;
            return Ok(AuthMethod::KeyFile(Arc::new(key)));
        }

        if let Ok(agent) = AgentClient::connect_env().await {
            return Ok(AuthMethod::Agent(agent));
        }

        let home = std::env::var("HOME").map_err(|_| ConnectivityError::AgentUnavailable {
            reason: "SSH agent not available and HOME not set".to_string(),
        })?;

        let default_keys = [
            format!("{}/.ssh/id_ed25519", home),
            format!("{}/.ssh/id_rsa", home),
            format!("{}/.ssh/id_ecdsa", home),
        ];

        for key_path in &default_keys {
            if let Ok(key) = load_secret_key(key_path, None) {
                return Ok(AuthMethod::KeyFile(Arc::new(key)));
            }
        }

        Err(ConnectivityError::AgentUnavailable {
            reason: "SSH agent not available and no default keys found".to_string(),
        })
    }

    async fn authenticate(
        session: &mut Handle<SshHandler>,
        address: &TargetAddress,
        auth_method: AuthMethod,
    ) -> Result<bool, ConnectivityError> {
        match auth_method {
            AuthMethod::Agent(mut agent) => {
                let keys = agent.request_identities().await.map_err(|e| {
                    ConnectivityError::AgentUnavailable {
                        reason: format!("failed to list agent keys: {}", e),
                    }
                })?;

                if keys.is_empty() {
                    return Err(ConnectivityError::AgentUnavailable {
                        reason: "no keys in SSH agent".to_string(),
                    });
                }

                for key in &keys {
                    match session
                        .authenticate_publickey_with(&address.user, key.clone(), None, &mut agent)
                        .await
                    {
                        Ok(result) if result.success() => return Ok(true),
                        _ => continue,
                    }
                }
                Ok(false)
            }
            AuthMethod::KeyFile(key) => {
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|source| ConnectivityError::Protocol { source })?
                    .flatten();

                let result = session
                    .authenticate_publickey(
                        &address.user,
                        PrivateKeyWithHashAlg::new(key, hash_alg),
                    )
                    .await
                    .map_err(|source| ConnectivityError::Protocol { source })?;

                Ok(result.success())
            }
        }
    }

    async fn connect(&self) -> Result<Arc<Handle<SshHandler>>, ConnectivityError> {
        let address = &self.address;
        let auth_method = Self::resolve_auth_method(address).await?;

        let russh_config = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let handler = SshHandler {
            host: address.host.clone(),
            port: address.port,
            trust_on_first_use: address.trust_on_first_use,
            known_hosts_path: address.known_hosts_path.clone(),
        };

        let mut session = client::connect(
            Arc::new(russh_config),
            (address.host.as_str(), address.port),
            handler,
        )
        .await
        .map_err(|e| ConnectivityError::Connection {
            host: address.host.clone(),
            port: address.port,
            reason: e.to_string(),
        })?;

        let auth_success = Self::authenticate(&mut session, address, auth_method).await?;
        if !auth_success {
            return Err(ConnectivityError::Authentication {
                user: address.user.clone(),
                host: address.host.clone(),
            });
        }

        Ok(Arc::new(session))
    }

    /// Get or establish the session handle.
    async fn session(&self) -> Result<Arc<Handle<SshHandler>>, ConnectivityError> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let handle = self.connect().await?;
        *guard = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop the cached session so the next attempt reconnects.
    async fn invalidate_session(&self) {
        *self.handle.lock().await = None;
    }

    async fn exec_once(
        &self,
        handle: &Handle<SshHandler>,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, ConnectivityError> {
        match tokio::time::timeout(command.timeout, self.exec_inner(handle, &command.line)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectivityError::CommandTimeout {
                timeout: command.timeout,
            }),
        }
    }

    async fn exec_inner(
        &self,
        handle: &Handle<SshHandler>,
        command: &str,
    ) -> Result<ExecOutput, ConnectivityError> {
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|_| ConnectivityError::ChannelClosed)?;

        channel
            .exec(true, command)
            .await
            .map_err(|_| ConnectivityError::ChannelClosed)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0u32;

        let mut got_exit_status = false;
        let mut got_eof = false;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        // stderr
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = exit_status;
                    got_exit_status = true;
                    if got_eof {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    got_eof = true;
                    if got_exit_status {
                        break;
                    }
                }
                Some(ChannelMsg::Close) => {
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }

        // A channel that closed without an exit status means the connection
        // died mid-command.
        if !got_exit_status {
            return Err(ConnectivityError::ChannelClosed);
        }

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn run(&self, command: &RemoteCommand) -> Result<ExecOutput, ConnectivityError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match self.session().await {
                Ok(handle) => self.exec_once(&handle, command).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        "transient connectivity failure, retrying: {}",
                        e
                    );
                    self.invalidate_session().await;
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn target(&self) -> String {
        format!("{}@{}:{}", self.address.user, self.address.host, self.address.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_address_builder_applies_overrides() {
        let addr = TargetAddress::new("deploy.example.net", "deploy")
            .port(2222)
            .trust_on_first_use(true)
            .key_path("/home/ci/.ssh/id_ed25519");

        assert_eq!(addr.port, 2222);
        assert!(addr.trust_on_first_use);
        assert_eq!(
            addr.key_path,
            Some(PathBuf::from("/home/ci/.ssh/id_ed25519"))
        );
    }

    #[test]
    fn default_retry_policy_is_bounded() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay, Duration::from_secs(5));
    }

    #[test]
    fn executor_reports_target_identity() {
        let executor = SshExecutor::new(
            TargetAddress::new("app-01", "deploy").port(22),
            RetryPolicy::default(),
        );
        assert_eq!(executor.target(), "deploy@app-01:22");
    }
}
