//! Redirect: lookup, outbound connect, proxy attach
//!
//! The requesting channel is held by a [`RedirectSession`] from the moment
//! the target is found until the session finishes. The session is consumed
//! by [`RedirectSession::finish`], so the hold is released exactly once on
//! every path.

use crate::channel::Channel;
use crate::connector::{ChannelConnector, ConnectError};
use crate::event_loop::LoopHandle;
use crate::peer::PeerRegistry;
use crate::proxy::ProxyRelay;
use peerlink_proto::{codes, OutputStream};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest token kept for the deferred reply, in bytes
pub const MAX_TOKEN_LEN: usize = 255;

/// Where a redirect stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectState {
    /// Looking up the target
    LookupPending,
    /// Waiting for the outbound connection
    ConnectPending,
    /// Channels are relaying to each other
    Attached,
    /// Error reply sent
    Failed,
    /// Requester went away; nothing sent
    Abandoned,
}

impl RedirectState {
    /// No further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, RedirectState::Attached | RedirectState::Failed | RedirectState::Abandoned)
    }
}

fn bounded_token(token: &str) -> String {
    if token.len() <= MAX_TOKEN_LEN {
        return token.to_string();
    }
    let mut end = MAX_TOKEN_LEN;
    while !token.is_char_boundary(end) {
        end -= 1;
    }
    token[..end].to_string()
}

fn reply(channel: &Channel, token: &str, code: i32) {
    let mut out = OutputStream::reply(token);
    out.write_errno(code);
    channel.send(out.finish());
}

/// A redirect waiting on its outbound connection
#[derive(Debug)]
pub struct RedirectSession {
    token: String,
    requester: Arc<Channel>,
    state: RedirectState,
}

impl RedirectSession {
    /// Hold `requester` for a pending redirect
    pub fn new(token: &str, requester: Arc<Channel>) -> Self {
        Self {
            token: bounded_token(token),
            requester,
            state: RedirectState::ConnectPending,
        }
    }

    /// Correlation token, truncated to [`MAX_TOKEN_LEN`]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Current state
    pub fn state(&self) -> RedirectState {
        self.state
    }

    /// Finish with the connection outcome. Runs on the event loop.
    ///
    /// Consumes the session, releasing the requester.
    pub fn finish(mut self, outcome: Result<Arc<Channel>, ConnectError>, proxy: &dyn ProxyRelay) -> RedirectState {
        self.state = if self.requester.is_closed() {
            if let Ok(channel) = outcome {
                debug!("redirect {}: requester closed, dropping {}", self.token, channel.name());
                channel.close();
            }
            RedirectState::Abandoned
        } else {
            match outcome {
                Ok(channel) => {
                    proxy.attach(&self.requester, &channel);
                    reply(&self.requester, &self.token, codes::SUCCESS);
                    RedirectState::Attached
                }
                Err(e) => {
                    info!("redirect {}: {}", self.token, e);
                    reply(&self.requester, &self.token, e.errno());
                    RedirectState::Failed
                }
            }
        };
        self.state
    }
}

/// Sequences redirect commands
pub struct RedirectOrchestrator {
    registry: Arc<PeerRegistry>,
    connector: Arc<dyn ChannelConnector>,
    proxy: Arc<dyn ProxyRelay>,
    loop_handle: LoopHandle,
}

impl RedirectOrchestrator {
    /// Orchestrator resuming on the loop behind `loop_handle`
    pub fn new(
        registry: Arc<PeerRegistry>,
        connector: Arc<dyn ChannelConnector>,
        proxy: Arc<dyn ProxyRelay>,
        loop_handle: LoopHandle,
    ) -> Self {
        Self {
            registry,
            connector,
            proxy,
            loop_handle,
        }
    }

    /// Begin redirecting `requester` to `peer_id`.
    ///
    /// An unknown peer is answered immediately. Otherwise the connect runs
    /// as a task and the session finishes on the event loop. Must be called
    /// inside a tokio runtime.
    pub fn start(&self, token: &str, peer_id: &str, requester: &Arc<Channel>) -> RedirectState {
        debug!("redirect {}: {:?} {}", token, RedirectState::LookupPending, peer_id);
        let Some(peer) = self.registry.find(peer_id) else {
            debug!("redirect {}: unknown peer {}", token, peer_id);
            reply(requester, token, codes::UNKNOWN_PEER);
            return RedirectState::Failed;
        };

        let session = RedirectSession::new(token, Arc::clone(requester));
        debug!("redirect {}: connecting to {}", session.token(), peer.id);

        let connector = Arc::clone(&self.connector);
        let proxy = Arc::clone(&self.proxy);
        let loop_handle = self.loop_handle.clone();
        tokio::spawn(async move {
            let outcome = connector.connect(&peer).await;
            let established = outcome.as_ref().ok().cloned();
            let posted = loop_handle.post(move || {
                let state = session.finish(outcome, proxy.as_ref());
                debug!("redirect finished: {:?}", state);
            });
            if !posted {
                if let Some(channel) = established {
                    channel.close();
                }
                warn!("Event loop is gone, dropping redirect to {}", peer.id);
            }
        });
        RedirectState::ConnectPending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::peer::PeerRecord;
    use crate::proxy::ChannelProxy;
    use async_trait::async_trait;
    use bytes::Bytes;
    use peerlink_proto::message::ErrorReport;
    use peerlink_proto::{Message, MessageCodec};
    use std::sync::Mutex;
    use tokio::sync::{mpsc, oneshot};

    /// Connects only when the test releases the gate
    struct GatedConnector {
        gate: Mutex<Option<oneshot::Receiver<Result<(), i32>>>>,
        made: Mutex<Vec<Arc<Channel>>>,
    }

    impl GatedConnector {
        fn new() -> (Arc<Self>, oneshot::Sender<Result<(), i32>>) {
            let (tx, rx) = oneshot::channel();
            let connector = Arc::new(Self {
                gate: Mutex::new(Some(rx)),
                made: Mutex::new(Vec::new()),
            });
            (connector, tx)
        }
    }

    #[async_trait]
    impl ChannelConnector for GatedConnector {
        async fn connect(&self, peer: &PeerRecord) -> Result<Arc<Channel>, ConnectError> {
            let gate = self.gate.lock().unwrap().take().expect("single connect");
            match gate.await {
                Ok(Ok(())) => {
                    let (channel, _rx) = Channel::detached(peer.id.clone());
                    self.made.lock().unwrap().push(Arc::clone(&channel));
                    Ok(channel)
                }
                Ok(Err(code)) => Err(ConnectError::Io(std::io::Error::from_raw_os_error(code))),
                Err(_) => Err(ConnectError::NoAddress(peer.id.clone())),
            }
        }
    }

    struct Fixture {
        event_loop: EventLoop,
        orchestrator: RedirectOrchestrator,
        connector: Arc<GatedConnector>,
        gate: oneshot::Sender<Result<(), i32>>,
    }

    fn fixture() -> Fixture {
        let event_loop = EventLoop::new();
        let registry = Arc::new(PeerRegistry::new());
        registry.add(PeerRecord::new("target"));
        let (connector, gate) = GatedConnector::new();
        let orchestrator = RedirectOrchestrator::new(
            registry,
            connector.clone(),
            Arc::new(ChannelProxy),
            event_loop.handle(),
        );
        Fixture {
            event_loop,
            orchestrator,
            connector,
            gate,
        }
    }

    fn replies(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            let mut codec = MessageCodec::new();
            codec.feed(&bytes);
            out.push(codec.try_decode_message().unwrap().unwrap());
        }
        out
    }

    #[test]
    fn test_token_is_bounded() {
        let long = "x".repeat(400);
        assert_eq!(bounded_token(&long).len(), MAX_TOKEN_LEN);

        let wide = "é".repeat(200);
        let bounded = bounded_token(&wide);
        assert!(bounded.len() <= MAX_TOKEN_LEN);
        assert!(bounded.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn test_redirect_attaches_proxy() {
        let mut f = fixture();
        let (requester, mut rx) = Channel::detached("client");

        let state = f.orchestrator.start("r1", "target", &requester);
        assert_eq!(state, RedirectState::ConnectPending);
        assert_eq!(Arc::strong_count(&requester), 2);

        f.gate.send(Ok(())).unwrap();
        f.event_loop.next().await;

        let target = f.connector.made.lock().unwrap()[0].clone();
        assert!(Arc::ptr_eq(&requester.proxy_peer().unwrap(), &target));
        assert!(Arc::ptr_eq(&target.proxy_peer().unwrap(), &requester));

        let got = replies(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].token.as_deref(), Some("r1"));
        assert_eq!(ErrorReport::read_field(&got[0].args).unwrap().0, 0);
        assert_eq!(Arc::strong_count(&requester), 1);
    }

    #[tokio::test]
    async fn test_connect_error_is_replied() {
        let mut f = fixture();
        let (requester, mut rx) = Channel::detached("client");

        f.orchestrator.start("r2", "target", &requester);
        f.gate.send(Err(libc::ECONNREFUSED)).unwrap();
        f.event_loop.next().await;

        let got = replies(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(ErrorReport::read_field(&got[0].args).unwrap().0, libc::ECONNREFUSED);
        assert!(!requester.is_proxied());
        assert_eq!(Arc::strong_count(&requester), 1);
    }

    #[tokio::test]
    async fn test_requester_closed_before_connect() {
        let mut f = fixture();
        let (requester, mut rx) = Channel::detached("client");

        f.orchestrator.start("r3", "target", &requester);
        requester.close();
        f.gate.send(Ok(())).unwrap();
        f.event_loop.next().await;

        let target = f.connector.made.lock().unwrap()[0].clone();
        assert!(target.is_closed());
        assert!(!target.is_proxied());
        assert!(replies(&mut rx).is_empty());
        assert_eq!(Arc::strong_count(&requester), 1);
    }

    #[tokio::test]
    async fn test_lost_loop_closes_new_channel() {
        let f = fixture();
        let (requester, _rx) = Channel::detached("client");

        f.orchestrator.start("r4", "target", &requester);
        drop(f.event_loop);
        f.gate.send(Ok(())).unwrap();

        let closed_target = async {
            loop {
                let made = f.connector.made.lock().unwrap().first().cloned();
                match made {
                    Some(target) if target.is_closed() => break target,
                    _ => tokio::task::yield_now().await,
                }
            }
        };
        let target = tokio::time::timeout(std::time::Duration::from_secs(5), closed_target)
            .await
            .unwrap();
        assert!(!target.is_proxied());
        assert_eq!(Arc::strong_count(&requester), 1);
    }

    #[test]
    fn test_finish_states() {
        let (requester, _rx) = Channel::detached("client");
        let session = RedirectSession::new("t", Arc::clone(&requester));
        assert_eq!(session.state(), RedirectState::ConnectPending);
        assert!(!session.state().is_terminal());

        let err = ConnectError::NoAddress("x".to_string());
        assert_eq!(session.finish(Err(err), &ChannelProxy), RedirectState::Failed);

        requester.close();
        let session = RedirectSession::new("t", Arc::clone(&requester));
        let err = ConnectError::NoAddress("x".to_string());
        assert_eq!(session.finish(Err(err), &ChannelProxy), RedirectState::Abandoned);
        assert_eq!(Arc::strong_count(&requester), 1);
    }
}
