//! Remote file-system client boundary used by the SFTP backend.
//!
//! [`RemoteFs`] covers the three directory operations the backend needs.
//! [`SshRemoteFs`] implements them by running `mkdir`, `test` and `rm` over
//! an SSH exec channel, one connection per call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, instrument, warn};

use crate::error::CsiError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Directory operations on a remote host.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Create `path` and any missing parents.
    async fn create_dir_all(&self, path: &str) -> Result<(), CsiError>;

    /// `Some(true)` for a directory, `Some(false)` for any other file type,
    /// `None` if nothing exists at `path`.
    async fn is_dir(&self, path: &str) -> Result<Option<bool>, CsiError>;

    /// Remove `path` recursively.  A missing path is not an error.
    async fn remove_all(&self, path: &str) -> Result<(), CsiError>;
}

/// How to authenticate to the SSH server.
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    /// PEM/OpenSSH-encoded private key, unencrypted.
    PrivateKey(String),
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(..)"),
            Self::PrivateKey(_) => f.write_str("PrivateKey(..)"),
        }
    }
}

/// [`RemoteFs`] over SSH exec.
#[derive(Debug, Clone)]
pub struct SshRemoteFs {
    host: String,
    port: u16,
    user: String,
    auth: SshAuth,
}

struct AcceptingHandler {
    host: String,
}

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // Host keys are not pinned; rclone itself connects the same way.
        warn!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "accepting SSH host key without verification"
        );
        Ok(true)
    }
}

/// Output of one remote command.
struct ExecOutput {
    status: u32,
    stdout: String,
    stderr: String,
}

impl SshRemoteFs {
    pub fn new(host: &str, port: u16, user: &str, auth: SshAuth) -> Self {
        Self {
            host: host.to_owned(),
            port,
            user: user.to_owned(),
            auth,
        }
    }

    async fn connect(&self) -> Result<Handle<AcceptingHandler>, CsiError> {
        let config = Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..<_>::default()
        };
        let handler = AcceptingHandler {
            host: self.host.clone(),
        };
        let addr = (self.host.as_str(), self.port);
        let mut session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(Arc::new(config), addr, handler),
        )
        .await
        .map_err(|_| {
            CsiError::BackendError(format!(
                "connect to {}:{} timed out after {CONNECT_TIMEOUT:?}",
                self.host, self.port
            ))
        })?
        .map_err(|e| CsiError::BackendError(format!("connect to {}:{}: {e}", self.host, self.port)))?;

        let result = match &self.auth {
            SshAuth::Password(password) => session
                .authenticate_password(&self.user, password)
                .await
                .map_err(CsiError::backend)?,
            SshAuth::PrivateKey(pem) => {
                let key = russh::keys::decode_secret_key(pem, None)
                    .map_err(|e| CsiError::InvalidArgument(format!("private_key: {e}")))?;
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                session
                    .authenticate_publickey(
                        &self.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(CsiError::backend)?
            }
        };
        if !result.success() {
            return Err(CsiError::BackendError(format!(
                "SSH authentication as {} on {} rejected",
                self.user, self.host
            )));
        }
        debug!(host = %self.host, user = %self.user, "SSH session established");
        Ok(session)
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, CsiError> {
        let session = self.connect().await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(CsiError::backend)?;
        channel
            .exec(true, command)
            .await
            .map_err(CsiError::backend)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }

        let status = status.ok_or_else(|| {
            CsiError::BackendError(format!("{command:?}: channel closed without exit status"))
        })?;
        Ok(ExecOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn run(&self, command: &str) -> Result<String, CsiError> {
        let output = self.exec(command).await?;
        if output.status != 0 {
            return Err(CsiError::BackendError(format!(
                "{command:?} exited with {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl RemoteFs for SshRemoteFs {
    #[instrument(skip(self), fields(host = %self.host))]
    async fn create_dir_all(&self, path: &str) -> Result<(), CsiError> {
        self.run(&format!("mkdir -p -- {}", shell_quote(path)))
            .await
            .map(drop)
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn is_dir(&self, path: &str) -> Result<Option<bool>, CsiError> {
        let stdout = self.run(&probe_command(path)).await?;
        parse_probe(&stdout)
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn remove_all(&self, path: &str) -> Result<(), CsiError> {
        self.run(&format!("rm -rf -- {}", shell_quote(path)))
            .await
            .map(drop)
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn probe_command(path: &str) -> String {
    let quoted = shell_quote(path);
    format!("if [ -d {quoted} ]; then echo dir; elif [ -e {quoted} ]; then echo file; else echo missing; fi")
}

fn parse_probe(stdout: &str) -> Result<Option<bool>, CsiError> {
    match stdout.trim() {
        "dir" => Ok(Some(true)),
        "file" => Ok(Some(false)),
        "missing" => Ok(None),
        other => Err(CsiError::BackendError(format!(
            "unexpected probe output {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/data/vol"), "'/data/vol'");
        assert_eq!(shell_quote("/it's"), r"'/it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn probe_parsing() {
        assert_eq!(parse_probe("dir\n").unwrap(), Some(true));
        assert_eq!(parse_probe("file\n").unwrap(), Some(false));
        assert_eq!(parse_probe("missing\n").unwrap(), None);
        assert!(parse_probe("").is_err());
    }

    #[test]
    fn probe_command_quotes_every_use() {
        let cmd = probe_command("/a b");
        assert_eq!(cmd.matches("'/a b'").count(), 2);
    }

    #[test]
    fn auth_debug_is_redacted() {
        let fs = SshRemoteFs::new("h", 22, "u", SshAuth::Password("hunter2".into()));
        assert!(!format!("{fs:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn unreachable_host_is_backend_error() {
        let fs = SshRemoteFs::new("127.0.0.1", 1, "u", SshAuth::Password("p".into()));
        let err = fs.is_dir("/x").await.unwrap_err();
        assert!(matches!(err, CsiError::BackendError(_)));
    }
}
