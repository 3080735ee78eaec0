//! Agent wiring and accept loop

use crate::asyncreq::AsyncDispatcher;
use crate::broadcast::{BroadcastGroup, PeerEventBroadcaster};
use crate::channel::Channel;
use crate::config::AgentConfig;
use crate::connection;
use crate::connector::{ChannelConnector, TcpConnector};
use crate::error::AgentError;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::locator::LocatorService;
use crate::peer::{
    PeerRecord, PeerRegistry, ATTR_AGENT_ID, ATTR_HOST, ATTR_NAME, ATTR_OS_NAME, ATTR_PORT, ATTR_TRANSPORT_NAME,
};
use crate::protocol::Protocol;
use crate::proxy::ChannelProxy;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A running peerlink agent
pub struct Agent {
    /// Configuration
    config: AgentConfig,
    /// Unique id of this agent process
    agent_id: Uuid,
    /// Known peers, including this agent
    registry: Arc<PeerRegistry>,
    /// Channels receiving peer events
    broadcast: Arc<BroadcastGroup>,
    /// Registered command handlers
    protocol: Arc<Protocol>,
    /// Blocking-call bridge
    dispatcher: Arc<AsyncDispatcher>,
    /// Loop that runs completions and redirect continuations
    event_loop: EventLoop,
    /// Id under which this agent is registered
    local_id: String,
    /// Shutdown signal receiver
    shutdown_rx: Option<oneshot::Receiver<()>>,
    /// Shutdown signal sender (handed out once)
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Agent {
    /// Build an agent with the TCP connector
    pub fn new(config: AgentConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Build an agent that opens redirect targets with `connector`
    pub fn with_connector(config: AgentConfig, connector: Arc<dyn ChannelConnector>) -> Self {
        let event_loop = EventLoop::new();
        let registry = Arc::new(PeerRegistry::new());
        let broadcast = Arc::new(BroadcastGroup::new());
        registry.add_listener(Arc::new(PeerEventBroadcaster::new(Arc::clone(&broadcast))));

        let locator = LocatorService::new(
            Arc::clone(&registry),
            connector,
            Arc::new(ChannelProxy),
            event_loop.handle(),
        );
        let mut protocol = Protocol::new();
        locator.register(&mut protocol);

        let dispatcher = Arc::new(AsyncDispatcher::new(config.dispatcher.clone()));
        if let Some(native) = dispatcher.native_name() {
            info!("Positioned I/O uses {}", native);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut agent = Self {
            agent_id: Uuid::new_v4(),
            registry,
            broadcast,
            protocol: Arc::new(protocol),
            dispatcher,
            event_loop,
            local_id: String::new(),
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx: Some(shutdown_tx),
            config,
        };
        agent.register_local(agent.config.listen);
        for peer in &agent.config.peers {
            agent.registry.add(peer.to_record());
        }
        agent
    }

    /// Record advertised for this agent at `addr`
    pub fn local_record(&self, addr: SocketAddr) -> PeerRecord {
        let host = addr.ip().to_string();
        let port = addr.port().to_string();
        PeerRecord::new(format!("TCP:{}:{}", host, port))
            .with_attr(ATTR_NAME, self.config.name.clone())
            .with_attr(ATTR_OS_NAME, std::env::consts::OS)
            .with_attr(ATTR_TRANSPORT_NAME, "TCP")
            .with_attr(ATTR_HOST, host)
            .with_attr(ATTR_PORT, port)
            .with_attr(ATTR_AGENT_ID, self.agent_id.to_string())
    }

    fn register_local(&mut self, addr: SocketAddr) {
        let record = self.local_record(addr);
        if record.id == self.local_id {
            return;
        }
        if !self.local_id.is_empty() {
            self.registry.remove(&self.local_id);
        }
        self.local_id = record.id.clone();
        self.registry.add(record);
    }

    /// Id of this agent's own peer record
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Known peers
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Channels subscribed to events
    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    /// Blocking-call dispatcher
    pub fn dispatcher(&self) -> &Arc<AsyncDispatcher> {
        &self.dispatcher
    }

    /// Handle for posting onto the agent's event loop
    pub fn loop_handle(&self) -> LoopHandle {
        self.event_loop.handle()
    }

    /// Get shutdown sender for graceful shutdown
    pub fn shutdown_sender(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown_tx.take()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&mut self) -> Result<(), AgentError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown
    pub async fn serve(&mut self, listener: TcpListener) -> Result<(), AgentError> {
        let mut shutdown_rx = self.shutdown_rx.take().ok_or(AgentError::AlreadyRunning)?;
        let local = listener.local_addr()?;
        self.register_local(local);
        info!("Agent {} listening on {}", self.local_id, local);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Received shutdown signal, stopping agent");
                    break Ok(());
                }
                _ = self.event_loop.next() => {}
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            break Err(AgentError::Io(e));
                        }
                    }
                }
            }
        };

        let drained = self.event_loop.run_pending();
        debug!("Drained {} loop events on shutdown", drained);
        info!("Agent stopped");
        result
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }
        let (channel, outbound) = Channel::detached(addr.to_string());
        self.broadcast.subscribe(&channel);
        info!("Accepted connection from {}", addr);

        let protocol = Arc::clone(&self.protocol);
        tokio::spawn(async move {
            if let Err(e) = connection::serve(stream, channel, outbound, protocol).await {
                debug!("Connection {} ended: {}", addr, e);
            }
        });
    }
}
