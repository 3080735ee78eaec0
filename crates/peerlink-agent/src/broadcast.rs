//! Event fan-out to subscribed channels

use crate::channel::Channel;
use crate::locator::SERVICE;
use crate::peer::{PeerEvent, PeerListener, PeerRecord};
use bytes::Bytes;
use peerlink_proto::OutputStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Channels subscribed to asynchronous events
#[derive(Default)]
pub struct BroadcastGroup {
    channels: Mutex<Vec<Arc<Channel>>>,
}

impl BroadcastGroup {
    /// Empty group
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, Vec<Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a channel
    pub fn subscribe(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels();
        channels.retain(|c| !c.is_closed());
        channels.push(Arc::clone(channel));
    }

    /// Send one encoded message to every live channel.
    ///
    /// Closed channels and channels relaying for a proxy are dropped from
    /// the group. Returns how many channels were written.
    pub fn broadcast(&self, message: Bytes) -> usize {
        let mut channels = self.channels();
        channels.retain(|c| !c.is_closed() && !c.is_proxied());
        channels.iter().filter(|c| c.send(message.clone())).count()
    }

    /// Subscribed channels
    pub fn len(&self) -> usize {
        self.channels().len()
    }

    /// Whether nothing is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns registry changes into `Locator` events
pub struct PeerEventBroadcaster {
    group: Arc<BroadcastGroup>,
}

impl PeerEventBroadcaster {
    /// Broadcaster writing to `group`
    pub fn new(group: Arc<BroadcastGroup>) -> Self {
        Self { group }
    }

    fn encode(event: PeerEvent, peer: &PeerRecord) -> Option<Bytes> {
        let mut out = OutputStream::event(SERVICE, event.name());
        let written = match event {
            PeerEvent::Added | PeerEvent::Changed => out.write_json(peer),
            PeerEvent::HeartBeat | PeerEvent::Removed => out.write_json(&peer.id),
        };
        if let Err(e) = written {
            warn!("Failed to encode {} for {}: {}", event.name(), peer.id, e);
            return None;
        }
        out.write_byte(0);
        Some(out.finish())
    }
}

impl PeerListener for PeerEventBroadcaster {
    fn peer_changed(&self, event: PeerEvent, peer: &PeerRecord) {
        if !peer.discoverable {
            return;
        }
        let Some(message) = Self::encode(event, peer) else {
            return;
        };
        let sent = self.group.broadcast(message);
        debug!("{} {} sent to {} channels", event.name(), peer.id, sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRegistry;
    use peerlink_proto::{MessageCodec, MessageKind};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn decode(bytes: &Bytes) -> peerlink_proto::Message {
        let mut codec = MessageCodec::new();
        codec.feed(bytes);
        codec.try_decode_message().unwrap().unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(b) = rx.try_recv() {
            out.push(b);
        }
        out
    }

    #[test]
    fn test_closed_and_proxied_channels_pruned() {
        let group = BroadcastGroup::new();
        let (a, mut rx_a) = Channel::detached("a");
        let (b, _rx_b) = Channel::detached("b");
        let (c, _rx_c) = Channel::detached("c");
        let (d, _rx_d) = Channel::detached("d");
        group.subscribe(&a);
        group.subscribe(&b);
        group.subscribe(&c);

        b.close();
        c.set_proxy(&d);
        assert_eq!(group.broadcast(Bytes::from_static(b"x")), 1);
        assert_eq!(group.len(), 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn test_peer_events_on_the_wire() {
        let group = Arc::new(BroadcastGroup::new());
        let (channel, mut rx) = Channel::detached("client");
        group.subscribe(&channel);

        let registry = PeerRegistry::new();
        registry.add_listener(Arc::new(PeerEventBroadcaster::new(Arc::clone(&group))));
        registry.add(PeerRecord::new("p1").with_attr("Name", "one"));
        registry.heartbeat("p1");
        registry.remove("p1");

        let messages: Vec<_> = drain(&mut rx).iter().map(decode).collect();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.kind == MessageKind::Event));
        assert!(messages.iter().all(|m| m.service.as_deref() == Some(SERVICE)));

        assert_eq!(messages[0].name.as_deref(), Some("peerAdded"));
        assert_eq!(&messages[0].args[..], b"{\"ID\":\"p1\",\"Name\":\"one\"}\0");
        assert_eq!(messages[1].name.as_deref(), Some("peerHeartBeat"));
        assert_eq!(&messages[1].args[..], b"\"p1\"\0");
        assert_eq!(messages[2].name.as_deref(), Some("peerRemoved"));
        assert_eq!(&messages[2].args[..], b"\"p1\"\0");
    }

    #[test]
    fn test_undiscoverable_peer_sends_nothing() {
        let group = Arc::new(BroadcastGroup::new());
        let (channel, mut rx) = Channel::detached("client");
        group.subscribe(&channel);

        let registry = PeerRegistry::new();
        registry.add_listener(Arc::new(PeerEventBroadcaster::new(Arc::clone(&group))));
        let hidden = PeerRecord::new("hidden").with_discoverable(false);
        registry.add(hidden.clone());
        registry.add(hidden.with_attr("Name", "h"));
        assert!(registry.heartbeat("hidden"));
        assert!(registry.remove("hidden").is_some());
        assert!(drain(&mut rx).is_empty());

        registry.add(PeerRecord::new("shown"));
        assert!(registry.heartbeat("shown"));
        registry.remove("shown");
        assert_eq!(drain(&mut rx).len(), 3);
    }
}
