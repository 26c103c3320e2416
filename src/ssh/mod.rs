// ABOUTME: SSH remote execution: credentials, connections, keepalive, sessions and file transfer.
// ABOUTME: Built on russh; RemoteClient is the entry point for most callers.

mod client;
mod connection;
mod credentials;
mod endpoint;
mod error;
mod host_key;
mod keepalive;
mod pool;
mod scp;
mod session;
mod shell;
mod transfer;

pub use client::{KUBECONFIG_PATH, RemoteClient};
pub use connection::{
    ConnectOptions, Connection, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, TCP_KEEPALIVE_PERIOD,
};
pub use credentials::{
    AGENT_SOCK_ENV, AuthMethod, Credential, CredentialProvider, EnvAgentProvider, NoAgent,
    SocketAgentProvider, resolve as resolve_credentials,
};
pub use endpoint::{DEFAULT_PORT, Endpoint};
pub use error::{Error, ErrorKind, Result};
pub use host_key::HostKeyPolicy;
pub use keepalive::{ConnectionHealth, HealthStatus, KeepaliveHandle, LivenessProbe};
pub use pool::{ConnectionPool, DEFAULT_IDLE_TIMEOUT, Poolable};
pub use scp::{DEFAULT_MODE, RemoteTarget};
pub use session::{Capture, CommandResult, ExitStatus, Session};
pub use transfer::StagedFile;
