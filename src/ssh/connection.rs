// ABOUTME: Establishes authenticated SSH connections using russh.
// ABOUTME: Dials with TCP keepalive, verifies the host, authenticates in order, starts keepalive probing.

use super::credentials::{self, AuthMethod, Credential, CredentialProvider};
use super::endpoint::Endpoint;
use super::error::{Error, Result};
use super::host_key::{ClientHandler, HandshakeError, HostKeyPolicy};
use super::keepalive::{self, HealthStatus, KeepaliveHandle};
use super::session::Session;
use nonempty::NonEmpty;
use russh::client::{self, Config, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::agent::client::AgentClient;
use russh::Disconnect;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};

/// Ceiling on dial + handshake + authentication.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(600);
/// Idle time and interval for transport-level keepalive probes.
pub const TCP_KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);
/// Period of protocol-level keepalive requests.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for establishing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub handshake_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub keepalive_interval: Duration,
    pub host_key: HostKeyPolicy,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            tcp_keepalive: TCP_KEEPALIVE_PERIOD,
            keepalive_interval: KEEPALIVE_INTERVAL,
            host_key: HostKeyPolicy::default(),
        }
    }
}

impl ConnectOptions {
    pub fn host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Periods below one second are raised to one second.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(keepalive::MIN_PERIOD);
        self
    }
}

/// An authenticated connection with its own keepalive task.
pub struct Connection {
    endpoint: Endpoint,
    handle: Arc<Handle<ClientHandler>>,
    keepalive: KeepaliveHandle,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("handle", &"<russh::Handle>")
            .field("health", &self.health())
            .finish()
    }
}

impl Connection {
    /// Resolve credentials, dial, handshake and authenticate.
    ///
    /// Credentials are resolved before anything touches the network, so a
    /// caller with neither key material nor an agent fails without dialing.
    pub async fn establish(
        endpoint: &Endpoint,
        credential: &Credential,
        provider: &dyn CredentialProvider,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let methods = credentials::resolve(credential, provider).await?;

        let handle = tokio::time::timeout(
            options.handshake_timeout,
            Self::handshake(endpoint, methods, options),
        )
        .await
        .map_err(|_| Error::Timeout(options.handshake_timeout))??;

        let handle = Arc::new(handle);
        let keepalive = keepalive::spawn(Arc::clone(&handle), options.keepalive_interval);

        tracing::debug!(endpoint = %endpoint, "connection established");
        Ok(Self {
            endpoint: endpoint.clone(),
            handle,
            keepalive,
        })
    }

    async fn handshake(
        endpoint: &Endpoint,
        methods: NonEmpty<AuthMethod>,
        options: &ConnectOptions,
    ) -> Result<Handle<ClientHandler>> {
        let stream = Self::dial(endpoint, options.tcp_keepalive).await?;

        let handler = ClientHandler::new(
            endpoint.host().to_string(),
            endpoint.port(),
            options.host_key.clone(),
        );

        let mut handle = client::connect_stream(Arc::new(Config::default()), stream, handler)
            .await
            .map_err(|e| match e {
                HandshakeError::HostKeyRejected(reason) => Error::HostKeyRejected {
                    host: endpoint.host().to_string(),
                    port: endpoint.port(),
                    reason,
                },
                HandshakeError::Protocol(source) => Error::Handshake {
                    addr: endpoint.addr(),
                    source,
                },
            })?;

        Self::authenticate(&mut handle, endpoint.username(), methods).await?;
        Ok(handle)
    }

    async fn dial(endpoint: &Endpoint, keepalive_period: Duration) -> Result<TcpStream> {
        let addr = endpoint.addr();
        let stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|source| Error::Dial {
                addr: addr.clone(),
                source,
            })?;

        let keepalive_period = keepalive_period.max(keepalive::MIN_PERIOD);
        let keepalive = TcpKeepalive::new().with_time(keepalive_period);
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
        let keepalive = keepalive.with_interval(keepalive_period);

        SockRef::from(&stream)
            .set_tcp_keepalive(&keepalive)
            .map_err(|source| Error::Dial { addr, source })?;

        Ok(stream)
    }

    /// Try each method in list order; the first accepted one wins.
    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        user: &str,
        methods: NonEmpty<AuthMethod>,
    ) -> Result<()> {
        for method in methods {
            let name = method.name();
            let accepted = match method {
                AuthMethod::PrivateKey(key) | AuthMethod::PassphraseProtectedKey(key) => {
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .map_err(Error::Protocol)?
                        .flatten();

                    handle
                        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                        .await
                        .map_err(Error::Protocol)?
                        .success()
                }
                AuthMethod::Agent(mut agent) => {
                    Self::authenticate_with_agent(handle, user, &mut agent).await
                }
            };

            if accepted {
                tracing::debug!(user, method = name, "authenticated");
                return Ok(());
            }
            tracing::debug!(user, method = name, "authentication method rejected");
        }

        Err(Error::AuthenticationFailed {
            user: user.to_string(),
        })
    }

    async fn authenticate_with_agent(
        handle: &mut Handle<ClientHandler>,
        user: &str,
        agent: &mut AgentClient<UnixStream>,
    ) -> bool {
        let keys = match agent.request_identities().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!(error = %e, "failed to list agent keys");
                return false;
            }
        };

        for key in keys {
            match handle
                .authenticate_publickey_with(user, key, None, agent)
                .await
            {
                Ok(result) if result.success() => return true,
                _ => continue,
            }
        }
        false
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn health(&self) -> HealthStatus {
        self.keepalive.health().status()
    }

    /// False once the transport closed or a keepalive probe failed.
    pub fn is_usable(&self) -> bool {
        !self.handle.is_closed() && self.keepalive.health().is_alive()
    }

    /// Open a fresh single-use session.
    pub async fn open_session(&self) -> Result<Session> {
        let channel = self.handle.channel_open_session().await?;
        Ok(Session::new(channel))
    }

    /// Stop keepalive probing and disconnect.
    pub async fn close(&self) -> Result<()> {
        self.keepalive.stop().await;

        if self.handle.is_closed() {
            return Ok(());
        }
        match tokio::time::timeout(
            CLOSE_TIMEOUT,
            self.handle.disconnect(Disconnect::ByApplication, "", "en"),
        )
        .await
        {
            Ok(result) => result.map_err(Error::Protocol),
            Err(_) => {
                tracing::warn!(endpoint = %self.endpoint, "timeout closing SSH connection, forcing drop");
                Ok(())
            }
        }
    }
}
