// ABOUTME: Client settings for machine-ssh, parsed from YAML.
// ABOUTME: Handles timeouts, host key policy, agent discovery, pooling and per-host overrides.

use crate::error::{Error, Result};
use crate::ssh::{
    AGENT_SOCK_ENV, ConnectOptions, ConnectionPool, Credential, CredentialProvider,
    EnvAgentProvider, Endpoint, HANDSHAKE_TIMEOUT, HostKeyPolicy, KEEPALIVE_INTERVAL, NoAgent,
    RemoteClient, SocketAgentProvider, TCP_KEEPALIVE_PERIOD,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    #[serde(default = "default_tcp_keepalive", with = "humantime_serde")]
    pub tcp_keepalive: Duration,

    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Duration,

    #[serde(default)]
    pub host_key: HostKeyPolicy,

    #[serde(default)]
    pub agent: AgentSource,

    #[serde(default)]
    pub pool: Option<PoolSettings>,

    /// Overrides keyed by endpoint host.
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointOverrides>,
}

/// Where the SSH agent comes from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AgentSource {
    /// Socket path read from an environment variable when credentials are resolved.
    Env {
        #[serde(default = "default_agent_var")]
        var: String,
    },
    Socket { path: PathBuf },
    Disabled,
}

impl Default for AgentSource {
    fn default() -> Self {
        AgentSource::Env {
            var: default_agent_var(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointOverrides {
    #[serde(default, with = "humantime_serde")]
    pub handshake_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub tcp_keepalive: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub keepalive_interval: Option<Duration>,

    #[serde(default)]
    pub host_key: Option<HostKeyPolicy>,
}

fn default_handshake_timeout() -> Duration {
    HANDSHAKE_TIMEOUT
}

fn default_tcp_keepalive() -> Duration {
    TCP_KEEPALIVE_PERIOD
}

fn default_keepalive_interval() -> Duration {
    KEEPALIVE_INTERVAL
}

fn default_idle_timeout() -> Duration {
    crate::ssh::DEFAULT_IDLE_TIMEOUT
}

fn default_agent_var() -> String {
    AGENT_SOCK_ENV.to_string()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            tcp_keepalive: default_tcp_keepalive(),
            keepalive_interval: default_keepalive_interval(),
            host_key: HostKeyPolicy::default(),
            agent: AgentSource::default(),
            pool: None,
            endpoints: HashMap::new(),
        }
    }
}

impl ClientSettings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<()> {
        let zero = |name: &str| Error::InvalidConfig(format!("{} must be greater than zero", name));

        if self.keepalive_interval.is_zero() {
            return Err(zero("keepalive_interval"));
        }
        if self.tcp_keepalive.is_zero() {
            return Err(zero("tcp_keepalive"));
        }
        for (host, overrides) in &self.endpoints {
            if overrides.keepalive_interval.is_some_and(|d| d.is_zero()) {
                return Err(zero(&format!("endpoints.{}.keepalive_interval", host)));
            }
            if overrides.tcp_keepalive.is_some_and(|d| d.is_zero()) {
                return Err(zero(&format!("endpoints.{}.tcp_keepalive", host)));
            }
        }
        Ok(())
    }

    /// Connection options for `endpoint`, with any per-host overrides applied.
    pub fn connect_options(&self, endpoint: &Endpoint) -> ConnectOptions {
        let mut options = ConnectOptions {
            handshake_timeout: self.handshake_timeout,
            tcp_keepalive: self.tcp_keepalive,
            keepalive_interval: self.keepalive_interval,
            host_key: self.host_key.clone(),
        };

        if let Some(overrides) = self.endpoints.get(endpoint.host()) {
            if let Some(timeout) = overrides.handshake_timeout {
                options.handshake_timeout = timeout;
            }
            if let Some(period) = overrides.tcp_keepalive {
                options.tcp_keepalive = period;
            }
            if let Some(interval) = overrides.keepalive_interval {
                options.keepalive_interval = interval;
            }
            if let Some(ref policy) = overrides.host_key {
                options.host_key = policy.clone();
            }
        }
        options
    }

    pub fn credential_provider(&self) -> Arc<dyn CredentialProvider> {
        match &self.agent {
            AgentSource::Env { var } => Arc::new(EnvAgentProvider::new(var.clone())),
            AgentSource::Socket { path } => Arc::new(SocketAgentProvider::new(path.clone())),
            AgentSource::Disabled => Arc::new(NoAgent),
        }
    }

    /// A new, empty pool when pooling is configured.
    pub fn connection_pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool
            .as_ref()
            .map(|pool| Arc::new(ConnectionPool::new(pool.idle_timeout)))
    }
}

/// Builds clients from one set of settings. Every client it hands out
/// shares the same agent provider and, when pooling is configured, the
/// same connection pool.
pub struct ClientFactory {
    settings: ClientSettings,
    provider: Arc<dyn CredentialProvider>,
    pool: Option<Arc<ConnectionPool>>,
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("settings", &self.settings)
            .field("pool", &self.pool)
            .finish()
    }
}

impl ClientFactory {
    pub fn new(settings: ClientSettings) -> Self {
        let provider = settings.credential_provider();
        let pool = settings.connection_pool();
        Self {
            settings,
            provider,
            pool,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    /// Build a client for `endpoint`.
    pub fn client(&self, endpoint: Endpoint, credential: Credential) -> RemoteClient {
        let options = self.settings.connect_options(&endpoint);
        let client = RemoteClient::new(endpoint, credential)
            .with_provider(Arc::clone(&self.provider))
            .with_options(options);

        match &self.pool {
            Some(pool) => client.with_pool(Arc::clone(pool)),
            None => client,
        }
    }

    /// Close every pooled connection. Clients built earlier stay valid and
    /// reconnect on their next call.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.close_all().await;
        }
    }
}

/// Parse `[user@]host[:port]`, falling back to `default_user`.
pub fn parse_endpoint(target: &str, default_user: &str) -> Result<Endpoint> {
    Endpoint::parse(target, default_user).map_err(Error::InvalidEndpoint)
}
