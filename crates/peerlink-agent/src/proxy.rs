//! Pairing two channels into a relay

use crate::channel::Channel;
use std::sync::Arc;
use tracing::info;

/// Links two established channels so traffic flows between them
pub trait ProxyRelay: Send + Sync {
    /// Relay everything read on `a` to `b` and vice versa
    fn attach(&self, a: &Arc<Channel>, b: &Arc<Channel>);
}

/// Relay over [`Channel`] proxy links.
///
/// Each connection task forwards messages read from its channel to the
/// partner, re-encoded verbatim; a task that ends closes both sides.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelProxy;

impl ProxyRelay for ChannelProxy {
    fn attach(&self, a: &Arc<Channel>, b: &Arc<Channel>) {
        a.set_proxy(b);
        b.set_proxy(a);
        info!("Proxy established between {} and {}", a.name(), b.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_links_both_ways() {
        let (a, _rx_a) = Channel::detached("a");
        let (b, _rx_b) = Channel::detached("b");
        ChannelProxy.attach(&a, &b);

        assert!(Arc::ptr_eq(&a.proxy_peer().unwrap(), &b));
        assert!(Arc::ptr_eq(&b.proxy_peer().unwrap(), &a));
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&b), 1);
    }
}
