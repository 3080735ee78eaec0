//! Agent configuration

use crate::asyncreq::DispatcherConfig;
use crate::peer::{PeerRecord, ATTR_HOST, ATTR_PORT, ATTR_TRANSPORT_NAME};
use std::net::SocketAddr;
use thiserror::Error;

/// Listen address variable
pub const ENV_LISTEN: &str = "PEERLINK_LISTEN";
/// Agent name variable
pub const ENV_NAME: &str = "PEERLINK_NAME";
/// Static peers variable, `id=host:port,...`
pub const ENV_PEERS: &str = "PEERLINK_PEERS";
/// Native positioned-I/O switch
pub const ENV_NATIVE_IO: &str = "PEERLINK_NATIVE_IO";
/// Worker thread stack size in bytes
pub const ENV_WORKER_STACK: &str = "PEERLINK_WORKER_STACK";

/// Default TCP port
pub const DEFAULT_PORT: u16 = 1534;

/// Invalid configuration input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed
    #[error("invalid value '{value}' for {var}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// A static peer entry is malformed
    #[error("invalid peer entry '{0}', expected id=host:port")]
    InvalidPeer(String),
}

/// A peer known from configuration rather than discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPeer {
    /// Peer identifier
    pub id: String,
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl StaticPeer {
    /// Parse `id=host:port`
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidPeer(entry.to_string());
        let (id, addr) = entry.split_once('=').ok_or_else(invalid)?;
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        let (id, host) = (id.trim(), host.trim().trim_start_matches('[').trim_end_matches(']'));
        if id.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Registry record for this peer
    pub fn to_record(&self) -> PeerRecord {
        PeerRecord::new(self.id.clone())
            .with_attr(ATTR_TRANSPORT_NAME, "TCP")
            .with_attr(ATTR_HOST, self.host.clone())
            .with_attr(ATTR_PORT, self.port.to_string())
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the agent listens on
    pub listen: SocketAddr,
    /// Advertised agent name
    pub name: String,
    /// Peers registered at startup
    pub peers: Vec<StaticPeer>,
    /// Blocking-call dispatcher settings
    pub dispatcher: DispatcherConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            name: "peerlink-agent".to_string(),
            peers: Vec::new(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `PEERLINK_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_LISTEN) {
            config.listen = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_LISTEN,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_NAME) {
            config.name = value;
        }
        if let Some(value) = lookup(ENV_PEERS) {
            config.peers = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(StaticPeer::parse)
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = lookup(ENV_NATIVE_IO) {
            config.dispatcher.native_io = parse_bool(&value).ok_or(ConfigError::InvalidValue {
                var: ENV_NATIVE_IO,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_WORKER_STACK) {
            let size: usize = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_WORKER_STACK,
                value,
            })?;
            config.dispatcher.pool.stack_size = Some(size);
        }

        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
