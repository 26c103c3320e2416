// ABOUTME: High-level remote client: run commands, fetch kubeconfig, copy files, manage authorized keys.
// ABOUTME: Every call releases its session and (unless pooled) its connection on all exit paths.

use super::connection::{ConnectOptions, Connection};
use super::credentials::{Credential, CredentialProvider, EnvAgentProvider};
use super::endpoint::Endpoint;
use super::error::{Error, ErrorKind, Result};
use super::pool::ConnectionPool;
use super::scp::{self, RemoteTarget};
use super::session::{Capture, CommandResult};
use super::shell;
use super::transfer::{self, StagedFile};
use russh::keys::ssh_key::PublicKey;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Fixed location of the cluster admin kubeconfig on control-plane machines.
pub const KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

const AUTHORIZED_KEYS: &str = "\"$HOME/.ssh/authorized_keys\"";

/// Client bound to one endpoint and credential.
pub struct RemoteClient {
    endpoint: Endpoint,
    credential: Credential,
    provider: Arc<dyn CredentialProvider>,
    options: ConnectOptions,
    pool: Option<Arc<ConnectionPool>>,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential)
            .field("options", &self.options)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// A connection held for the duration of one call.
enum Lease {
    Owned(Connection),
    Pooled(Arc<Connection>),
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            Lease::Owned(conn) => conn,
            Lease::Pooled(conn) => conn,
        }
    }
}

impl RemoteClient {
    /// Client that reads the agent socket from `SSH_AUTH_SOCK` and connects per call.
    pub fn new(endpoint: Endpoint, credential: Credential) -> Self {
        Self {
            endpoint,
            credential,
            provider: Arc::new(EnvAgentProvider::default()),
            options: ConnectOptions::default(),
            pool: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Share connections through `pool` instead of connecting per call.
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    /// Run `command`, log its combined output, and fail if it exits non-zero.
    pub async fn run(&self, command: &str) -> Result<()> {
        let result = self.execute(command, Capture::Combined).await?;

        let output = String::from_utf8_lossy(&result.output);
        tracing::info!(
            endpoint = %self.endpoint,
            command,
            exit = %result.exit,
            output = %output.trim_end(),
            "remote command finished"
        );

        match result.exit_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run `command` and return its stdout along with its exit status.
    ///
    /// A non-zero exit is not an `Err`: the output is still returned and
    /// `CommandResult::exit_error` reports the failure.
    pub async fn run_for_output(&self, command: &str) -> Result<CommandResult> {
        self.execute(command, Capture::Stdout).await
    }

    pub async fn kubeconfig_bytes(&self) -> Result<Vec<u8>> {
        let command = format!("cat {}", KUBECONFIG_PATH);
        self.run_for_output(&command).await?.into_output()
    }

    pub async fn kubeconfig(&self) -> Result<String> {
        Ok(String::from_utf8(self.kubeconfig_bytes().await?)?)
    }

    /// Copy `content` to `remote_path` with mode 0644.
    pub async fn write_file(&self, content: &[u8], remote_path: &str) -> Result<()> {
        self.write_file_with_mode(content, remote_path, scp::DEFAULT_MODE)
            .await
    }

    /// Copy `content` to `remote_path`. The content is staged in a local
    /// temporary file that is removed however the transfer ends.
    pub async fn write_file_with_mode(
        &self,
        content: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<()> {
        let target = RemoteTarget::parse(remote_path)?;
        let staged = StagedFile::stage(content)?;

        let lease = self.lease().await?;
        let result = async {
            let session = lease.open_session().await?;
            let mut stream = session.exec_stream(&target.sink_command()).await?;
            transfer::copy_staged(staged, &mut stream, &target, mode).await
        }
        .await;
        self.release(lease, result.as_ref().err()).await;

        if result.is_ok() {
            tracing::info!(endpoint = %self.endpoint, remote_path, bytes = content.len(), "file copied");
        }
        result
    }

    /// Append `public_key` to the remote user's authorized keys unless already present.
    pub async fn authorize_public_key(&self, public_key: &str) -> Result<()> {
        let line = authorized_key_line(public_key)?;
        self.run(&authorize_command(&line)).await
    }

    /// Remove every authorized keys line equal to `public_key`.
    pub async fn revoke_public_key(&self, public_key: &str) -> Result<()> {
        let line = authorized_key_line(public_key)?;
        self.run(&revoke_command(&line)).await
    }

    async fn execute(&self, command: &str, capture: Capture) -> Result<CommandResult> {
        let lease = self.lease().await?;
        let result = async {
            let session = lease.open_session().await?;
            session.run(command, capture).await
        }
        .await;
        self.release(lease, result.as_ref().err()).await;
        result
    }

    async fn lease(&self) -> Result<Lease> {
        let connect = || {
            Connection::establish(
                &self.endpoint,
                &self.credential,
                self.provider.as_ref(),
                &self.options,
            )
        };

        match &self.pool {
            Some(pool) => Ok(Lease::Pooled(pool.acquire(&self.endpoint, connect).await?)),
            None => Ok(Lease::Owned(connect().await?)),
        }
    }

    async fn release(&self, lease: Lease, error: Option<&Error>) {
        match lease {
            Lease::Owned(conn) => {
                if let Err(e) = conn.close().await {
                    tracing::debug!(endpoint = %self.endpoint, error = %e, "error closing connection");
                }
            }
            Lease::Pooled(conn) => {
                let Some(pool) = &self.pool else { return };
                let broken = error.is_some_and(|e| e.kind() == ErrorKind::Protocol);
                if broken {
                    pool.invalidate_connection(&self.endpoint, &conn).await;
                } else {
                    pool.release(&self.endpoint);
                }
            }
        }
    }
}

/// Parse and normalize one OpenSSH public key line.
fn authorized_key_line(public_key: &str) -> Result<String> {
    let key = PublicKey::from_openssh(public_key.trim())
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    key.to_openssh()
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))
}

fn authorize_command(line: &str) -> String {
    let key = shell::quote(line);
    format!(
        "umask 077 && mkdir -p \"$HOME/.ssh\" && F={file} && touch \"$F\" && \
         {{ [ -z \"$(tail -c1 \"$F\")\" ] || echo >> \"$F\"; }} && \
         {{ grep -qxF {key} \"$F\" || printf '%s\\n' {key} >> \"$F\"; }}",
        file = AUTHORIZED_KEYS,
        key = key,
    )
}

/// The filtered copy replaces the file only when grep read it completely
/// (exit 0 or 1); any other outcome leaves the file untouched.
fn revoke_command(line: &str) -> String {
    let key = shell::quote(line);
    format!(
        "F={file}; if [ -f \"$F\" ]; then \
         tmp=$(mktemp \"$F.XXXXXX\") || exit 1; \
         grep -vxF {key} \"$F\" > \"$tmp\"; rc=$?; \
         if [ $rc -gt 1 ]; then rm -f \"$tmp\"; exit $rc; fi; \
         mv -f \"$tmp\" \"$F\"; fi",
        file = AUTHORIZED_KEYS,
        key = key,
    )
}
