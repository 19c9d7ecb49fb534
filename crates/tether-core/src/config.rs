//! Process configuration.
//!
//! Built once at startup and passed by reference into the session, the
//! reverse listener loop, and the proxy endpoint. There is no ambient
//! global configuration.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{TunnelError, TunnelResult};

/// How the remote host's key is verified during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key without verification.
    #[default]
    AcceptAll,
    /// Accept only a key with this SHA-256 fingerprint. The `SHA256:`
    /// prefix is optional.
    Fingerprint(String),
    /// Verify against the user's OpenSSH `known_hosts` file; unknown or
    /// changed keys are rejected.
    KnownHosts,
}

/// A `host:port` pair as written on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl FromStr for HostPort {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::Config(format!("address `{s}` is not host:port")))?;
        if host.is_empty() {
            return Err(TunnelError::Config(format!("address `{s}` has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TunnelError::Config(format!("address `{s}` has an invalid port")))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Startup configuration for the whole tunnel process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Username for authentication on the remote host.
    pub username: String,
    /// Remote host to connect to. Required.
    pub host: String,
    /// Remote SSH port.
    pub port: u16,
    /// Local listen address for the HTTP forward proxy.
    pub proxy_addr: SocketAddr,
    /// Local destination that reverse-tunneled connections are forwarded to.
    pub local_addr: HostPort,
    /// Bind address requested on the remote side.
    pub remote_addr: HostPort,
    /// Password credential. `None` when not configured.
    pub password: Option<String>,
    /// Private key file. `None` disables key authentication.
    pub key_path: Option<PathBuf>,
    /// Host key verification policy.
    pub host_key: HostKeyPolicy,
}

impl Config {
    /// Checks the startup invariants that do not require I/O.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.host.is_empty() {
            return Err(TunnelError::Config("remote host is required".into()));
        }
        if self.username.is_empty() {
            return Err(TunnelError::Config("username is required".into()));
        }
        Ok(())
    }
}
