// ABOUTME: Remote host identity verification for the russh client handler.
// ABOUTME: Supports known_hosts (optionally TOFU), pinned fingerprints and an explicit insecure mode.

use russh::client;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::ssh_key::{self, HashAlg};
use serde::Deserialize;
use std::path::PathBuf;

/// How the server's host key is checked during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Verify against a known_hosts file (default `~/.ssh/known_hosts`).
    /// Unknown hosts are rejected unless `trust_on_first_use` is set.
    KnownHosts {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        trust_on_first_use: bool,
    },
    /// Accept only a key with this SHA-256 fingerprint (`SHA256:...`).
    Pinned { fingerprint: String },
    /// Accept any key. Offers no protection against man-in-the-middle attacks.
    InsecureAcceptAny,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts {
            path: None,
            trust_on_first_use: false,
        }
    }
}

/// Outcome of a host key check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Accepted,
    Rejected(String),
}

impl HostKeyPolicy {
    pub(crate) fn verify(
        &self,
        host: &str,
        port: u16,
        server_public_key: &ssh_key::PublicKey,
    ) -> Verdict {
        match self {
            HostKeyPolicy::InsecureAcceptAny => {
                tracing::warn!(host, port, "accepting host key without verification");
                Verdict::Accepted
            }
            HostKeyPolicy::Pinned { fingerprint } => {
                let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
                if actual == *fingerprint {
                    Verdict::Accepted
                } else {
                    Verdict::Rejected(format!(
                        "fingerprint {} does not match pinned {}",
                        actual, fingerprint
                    ))
                }
            }
            HostKeyPolicy::KnownHosts {
                path,
                trust_on_first_use,
            } => verify_known_hosts(host, port, server_public_key, path.as_ref(), *trust_on_first_use),
        }
    }
}

fn verify_known_hosts(
    host: &str,
    port: u16,
    server_public_key: &ssh_key::PublicKey,
    path: Option<&PathBuf>,
    trust_on_first_use: bool,
) -> Verdict {
    let check_result = match path {
        Some(path) => check_known_hosts_path(host, port, server_public_key, path),
        None => check_known_hosts(host, port, server_public_key),
    };

    match check_result {
        Ok(true) => Verdict::Accepted,
        Ok(false) if trust_on_first_use => {
            tracing::warn!(host, port, "Trust-On-First-Use: accepting unknown host key");
            let learn_result = match path {
                Some(path) => learn_known_hosts_path(host, port, server_public_key, path),
                None => learn_known_hosts(host, port, server_public_key),
            };
            if let Err(e) = learn_result {
                tracing::warn!(error = %e, "failed to save host key to known_hosts");
            }
            Verdict::Accepted
        }
        Ok(false) => Verdict::Rejected("host is not in known_hosts".to_string()),
        Err(russh::keys::Error::KeyChanged { line }) => Verdict::Rejected(format!(
            "host key changed (known_hosts line {})",
            line
        )),
        // Unreadable verification data only passes when TOFU was requested.
        Err(e) if trust_on_first_use => {
            tracing::warn!(host, port, error = %e, "known_hosts unavailable, trusting on first use");
            Verdict::Accepted
        }
        Err(e) => Verdict::Rejected(format!("known_hosts unavailable: {}", e)),
    }
}

/// russh client handler carrying the verification policy for one endpoint.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub(crate) fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host,
            port,
            policy,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = HandshakeError;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy.verify(&self.host, self.port, server_public_key) {
            Verdict::Accepted => Ok(true),
            Verdict::Rejected(reason) => {
                tracing::error!(host = %self.host, port = self.port, %reason, "host key verification failed");
                Err(HandshakeError::HostKeyRejected(reason))
            }
        }
    }
}

/// Handler error: either a protocol failure or our own host key rejection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum HandshakeError {
    #[error(transparent)]
    Protocol(#[from] russh::Error),

    #[error("host key rejected: {0}")]
    HostKeyRejected(String),
}
