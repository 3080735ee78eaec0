//! The `Locator` service: peer enumeration and connection redirect

use crate::channel::Channel;
use crate::connector::ChannelConnector;
use crate::event_loop::LoopHandle;
use crate::peer::{PeerRecord, PeerRegistry};
use crate::protocol::Protocol;
use crate::proxy::ProxyRelay;
use peerlink_proto::{codes, ArgReader, OutputStream, ProtocolError};
use std::sync::Arc;

/// Redirect sequencing
pub mod redirect;

pub use redirect::{RedirectOrchestrator, RedirectSession, RedirectState, MAX_TOKEN_LEN};

/// Service name on the wire
pub const SERVICE: &str = "Locator";

/// Command handlers for [`SERVICE`]
pub struct LocatorService {
    registry: Arc<PeerRegistry>,
    redirect: RedirectOrchestrator,
}

impl LocatorService {
    /// Service over `registry`, opening redirect targets with `connector`
    pub fn new(
        registry: Arc<PeerRegistry>,
        connector: Arc<dyn ChannelConnector>,
        proxy: Arc<dyn ProxyRelay>,
        loop_handle: LoopHandle,
    ) -> Arc<Self> {
        let redirect = RedirectOrchestrator::new(Arc::clone(&registry), connector, proxy, loop_handle);
        Arc::new(Self { registry, redirect })
    }

    /// Register `sync`, `getPeers` and `redirect`
    pub fn register(self: &Arc<Self>, protocol: &mut Protocol) {
        let service = Arc::clone(self);
        protocol.register(
            SERVICE,
            "sync",
            Arc::new(move |token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>| {
                service.sync(token, args, channel)
            }),
        );
        let service = Arc::clone(self);
        protocol.register(
            SERVICE,
            "getPeers",
            Arc::new(move |token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>| {
                service.get_peers(token, args, channel)
            }),
        );
        let service = Arc::clone(self);
        protocol.register(
            SERVICE,
            "redirect",
            Arc::new(move |token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>| {
                service.redirect(token, args, channel)
            }),
        );
    }

    /// Liveness probe
    pub fn sync(&self, token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>) -> Result<(), ProtocolError> {
        args.expect_end()?;
        let mut out = OutputStream::reply(token);
        out.write_errno(codes::SUCCESS);
        channel.send(out.finish());
        Ok(())
    }

    /// Reply with every discoverable peer
    pub fn get_peers(&self, token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>) -> Result<(), ProtocolError> {
        args.expect_end()?;
        let peers: Vec<PeerRecord> = self
            .registry
            .peers()
            .into_iter()
            .filter(|p| p.discoverable)
            .collect();

        let mut out = OutputStream::reply(token);
        out.write_errno(codes::SUCCESS);
        out.write_json(&peers)?;
        out.write_byte(0);
        channel.send(out.finish());
        Ok(())
    }

    /// Read the target id and hand off to the orchestrator
    pub fn redirect(&self, token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>) -> Result<(), ProtocolError> {
        let peer_id: String = args.read_json()?;
        args.expect_nul()?;
        args.expect_end()?;
        self.redirect.start(token, &peer_id, channel);
        Ok(())
    }
}
