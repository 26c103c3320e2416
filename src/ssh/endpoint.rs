// ABOUTME: Remote target identity for SSH connections.
// ABOUTME: Parses "host", "user@host", "host:port", "user@[v6addr]:port" and bare IPv6 addresses.

use serde::Deserialize;
use std::fmt;

pub const DEFAULT_PORT: u16 = 22;

/// Remote host, port and login user. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Endpoint {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(alias = "user")]
    username: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// Parse `[user@]host[:port]`, falling back to `default_user` when no user is given.
    pub fn parse(s: &str, default_user: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("endpoint cannot be empty".to_string());
        }

        let (user_part, rest) = match s.split_once('@') {
            Some((user, rest)) => (Some(user), rest),
            None => (None, s),
        };

        let (host, port) = if let Some(inner) = rest.strip_prefix('[') {
            // [v6addr]:port
            let (host, tail) = inner
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 address: {}", rest))?;
            let port = match tail.strip_prefix(':') {
                Some(port_str) => parse_port(port_str)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(format!("unexpected characters after address: {}", tail)),
            };
            (host, port)
        } else if rest.matches(':').count() > 1 {
            // Bare IPv6 address; a port needs the bracketed form.
            (rest, DEFAULT_PORT)
        } else if let Some((host, port_str)) = rest.split_once(':') {
            (host, parse_port(port_str)?)
        } else {
            (rest, DEFAULT_PORT)
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }

        let username = user_part.unwrap_or(default_user);
        if username.is_empty() {
            return Err("username cannot be empty".to_string());
        }

        Ok(Self::new(host, port, username))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Address suitable for dialing.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("invalid port: {}", s))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.addr())
    }
}
