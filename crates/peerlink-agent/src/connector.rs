//! Outbound channel establishment

use crate::channel::Channel;
use crate::connection;
use crate::peer::{PeerRecord, ATTR_HOST, ATTR_PORT, ATTR_TRANSPORT_NAME};
use async_trait::async_trait;
use peerlink_proto::codes;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Why an outbound channel could not be opened
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Peer record lacks a usable host or port
    #[error("peer {0} has no usable address")]
    NoAddress(String),

    /// Peer is reachable only over a transport we do not speak
    #[error("unsupported transport {0}")]
    UnsupportedTransport(String),

    /// Connection attempt failed
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Error code to put in a reply
    pub fn errno(&self) -> i32 {
        match self {
            ConnectError::NoAddress(_) => codes::OTHER,
            ConnectError::UnsupportedTransport(_) => codes::INV_TRANSPORT,
            ConnectError::Io(e) => e.raw_os_error().unwrap_or(codes::OTHER),
        }
    }
}

/// Opens channels to peers
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connect to `peer` and return the live channel
    async fn connect(&self, peer: &PeerRecord) -> Result<Arc<Channel>, ConnectError>;
}

/// Connector for TCP peers
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    fn address(peer: &PeerRecord) -> Result<(String, u16), ConnectError> {
        if let Some(transport) = peer.attr(ATTR_TRANSPORT_NAME) {
            if !transport.eq_ignore_ascii_case("TCP") {
                return Err(ConnectError::UnsupportedTransport(transport.to_string()));
            }
        }
        let host = peer
            .attr(ATTR_HOST)
            .ok_or_else(|| ConnectError::NoAddress(peer.id.clone()))?;
        let port = peer
            .attr(ATTR_PORT)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ConnectError::NoAddress(peer.id.clone()))?;
        Ok((host.to_string(), port))
    }
}

#[async_trait]
impl ChannelConnector for TcpConnector {
    async fn connect(&self, peer: &PeerRecord) -> Result<Arc<Channel>, ConnectError> {
        let (host, port) = Self::address(peer)?;
        debug!("Connecting to peer {} at {}:{}", peer.id, host, port);

        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        let name = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => format!("{}:{}", host, port),
        };
        info!("Connected to peer {} ({})", peer.id, name);

        let (channel, outbound) = Channel::detached(name);
        let task_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            if let Err(e) = connection::relay(stream, task_channel, outbound).await {
                debug!("Outbound connection ended: {}", e);
            }
        });
        Ok(channel)
    }
}
