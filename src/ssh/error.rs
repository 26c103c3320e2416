// ABOUTME: SSH-specific error types.
// ABOUTME: Covers dialing, authentication, handshake, remote exit and transfer failures.

use super::session::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse private key: {0}")]
    KeyParse(#[source] russh::keys::Error),

    #[error("private key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("a passphrase was given but the private key is not encrypted")]
    UnexpectedPassphrase,

    #[error("no authentication methods available: no key material and no SSH agent")]
    NoCredentials,

    #[error("authentication failed for user {user}: all methods exhausted")]
    AuthenticationFailed { user: String },

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("host key for {host}:{port} rejected: {reason}")]
    HostKeyRejected {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote command exited with {0}")]
    Exit(ExitStatus),

    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed,

    #[error("failed to stage temporary file: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("remote copy to {remote_path} failed: {reason}")]
    Transfer { remote_path: String, reason: String },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("remote output is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error class for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The remote host could not be reached.
    Dial,
    /// Key material was unusable or every method was refused.
    Authentication,
    /// Protocol negotiation, host identity or the handshake ceiling failed.
    Handshake,
    /// The remote command ran but did not succeed.
    RemoteExecution,
    /// A local temporary resource could not be created or written.
    LocalResource,
    /// The copy sub-protocol reported a failure.
    Transfer,
    /// Anything else on an established connection.
    Protocol,
}

impl Error {
    /// Returns the error class for programmatic handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Dial { .. } => ErrorKind::Dial,
            Error::KeyParse(_)
            | Error::KeyEncoding(_)
            | Error::UnexpectedPassphrase
            | Error::NoCredentials
            | Error::AuthenticationFailed { .. }
            | Error::AgentUnavailable(_) => ErrorKind::Authentication,
            Error::Handshake { .. } | Error::HostKeyRejected { .. } | Error::Timeout(_) => {
                ErrorKind::Handshake
            }
            Error::Exit(_) => ErrorKind::RemoteExecution,
            Error::TempFile(_) => ErrorKind::LocalResource,
            Error::Transfer { .. } => ErrorKind::Transfer,
            Error::InvalidPublicKey(_)
            | Error::InvalidUtf8(_)
            | Error::ChannelClosed
            | Error::Protocol(_)
            | Error::Io(_) => ErrorKind::Protocol,
        }
    }

    /// Returns the remote exit status if this is a remote execution failure.
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        match self {
            Error::Exit(status) => Some(status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
