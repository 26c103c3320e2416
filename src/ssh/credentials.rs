// ABOUTME: Credential resolution into an ordered list of authentication methods.
// ABOUTME: Private key material is tried first, then an SSH agent if one is reachable.

use super::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use nonempty::NonEmpty;
use russh::keys::agent::client::AgentClient;
use russh::keys::{decode_secret_key, ssh_key};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;

/// Environment variable pointing at the local SSH agent socket.
pub const AGENT_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Private key material and optional passphrase. Never persisted.
#[derive(Default)]
pub struct Credential {
    private_key: Option<SecretSlice<u8>>,
    passphrase: Option<SecretString>,
}

impl Credential {
    /// Credential with no key material; only an agent can authenticate.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(private_key: impl Into<Vec<u8>>, passphrase: Option<&str>) -> Self {
        let private_key: Vec<u8> = private_key.into();
        Self {
            private_key: (!private_key.is_empty()).then(|| SecretSlice::from(private_key)),
            passphrase: passphrase
                .filter(|p| !p.is_empty())
                .map(|p| SecretString::from(p.to_string())),
        }
    }

    /// Decode base64-encoded key material as stored in a secret object.
    pub fn from_base64(encoded: &str, passphrase: Option<&str>) -> Result<Self> {
        let decoded = STANDARD.decode(encoded.trim())?;
        Ok(Self::new(decoded, passphrase))
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One way of proving identity during the handshake.
pub enum AuthMethod {
    PrivateKey(Arc<ssh_key::PrivateKey>),
    PassphraseProtectedKey(Arc<ssh_key::PrivateKey>),
    Agent(AgentClient<UnixStream>),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PrivateKey(_) => "private-key",
            AuthMethod::PassphraseProtectedKey(_) => "passphrase-protected-key",
            AuthMethod::Agent(_) => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source of a local SSH agent channel.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Connect to the agent, or `None` when no agent is reachable.
    async fn agent(&self) -> Option<AgentClient<UnixStream>>;
}

/// Reads the agent socket path from the environment at resolution time.
#[derive(Debug, Clone)]
pub struct EnvAgentProvider {
    var: String,
}

impl EnvAgentProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        std::env::var_os(&self.var)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }
}

impl Default for EnvAgentProvider {
    fn default() -> Self {
        Self::new(AGENT_SOCK_ENV)
    }
}

#[async_trait]
impl CredentialProvider for EnvAgentProvider {
    async fn agent(&self) -> Option<AgentClient<UnixStream>> {
        let path = self.socket_path()?;
        connect_agent(path).await
    }
}

/// Agent at a fixed socket path.
#[derive(Debug, Clone)]
pub struct SocketAgentProvider {
    path: PathBuf,
}

impl SocketAgentProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialProvider for SocketAgentProvider {
    async fn agent(&self) -> Option<AgentClient<UnixStream>> {
        connect_agent(self.path.clone()).await
    }
}

/// Never offers an agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAgent;

#[async_trait]
impl CredentialProvider for NoAgent {
    async fn agent(&self) -> Option<AgentClient<UnixStream>> {
        None
    }
}

async fn connect_agent(path: PathBuf) -> Option<AgentClient<UnixStream>> {
    match AgentClient::connect_uds(&path).await {
        Ok(agent) => Some(agent),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "SSH agent not reachable");
            None
        }
    }
}

/// Build the ordered method list: private key first, then the agent.
///
/// A key that fails to parse aborts resolution; the agent is not used as a
/// silent substitute for a broken key.
pub async fn resolve(
    credential: &Credential,
    provider: &dyn CredentialProvider,
) -> Result<NonEmpty<AuthMethod>> {
    let mut methods = Vec::with_capacity(2);

    if let Some(method) = decode_key(credential)? {
        methods.push(method);
    }

    if let Some(agent) = provider.agent().await {
        methods.push(AuthMethod::Agent(agent));
    }

    NonEmpty::from_vec(methods).ok_or(Error::NoCredentials)
}

fn decode_key(credential: &Credential) -> Result<Option<AuthMethod>> {
    let Some(material) = &credential.private_key else {
        return Ok(None);
    };
    let pem = String::from_utf8_lossy(material.expose_secret());

    match &credential.passphrase {
        None => {
            let key = decode_secret_key(&pem, None).map_err(|e| {
                tracing::error!(error = %e, "could not parse private key");
                Error::KeyParse(e)
            })?;
            Ok(Some(AuthMethod::PrivateKey(Arc::new(key))))
        }
        Some(passphrase) => {
            // A key that opens without the passphrase is not protected by it.
            if decode_secret_key(&pem, None).is_ok() {
                tracing::error!("passphrase given for a private key that is not encrypted");
                return Err(Error::UnexpectedPassphrase);
            }
            let key = decode_secret_key(&pem, Some(passphrase.expose_secret())).map_err(|e| {
                tracing::error!(error = %e, "could not parse private key with passphrase");
                Error::KeyParse(e)
            })?;
            Ok(Some(AuthMethod::PassphraseProtectedKey(Arc::new(key))))
        }
    }
}
