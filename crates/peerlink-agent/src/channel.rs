//! Connection endpoints
//!
//! A [`Channel`] is the event-loop side of one connection: an outbound byte
//! sink drained by the transport's writer task, a closed flag, and an
//! optional proxy partner. Channels are shared as `Arc<Channel>`; holding a
//! clone keeps the endpoint alive but never keeps the connection open.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live connection
pub struct Channel {
    /// Peer description for logs
    name: String,
    /// Outbound sink, dropped on close so the writer task ends
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    /// Set once by `close`
    closed: AtomicBool,
    /// Wakes `closed()` waiters
    closed_notify: Notify,
    /// Proxy partner; messages read here are relayed to it
    proxy: Mutex<Option<Weak<Channel>>>,
}

impl Channel {
    /// Create a channel whose outbound bytes arrive on the returned receiver
    pub fn detached(name: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            name: name.into(),
            outbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            proxy: Mutex::new(None),
        });
        (channel, rx)
    }

    /// Peer description
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue one complete wire message for immediate transmission.
    /// Returns `false` if the channel is closed.
    pub fn send(&self, bytes: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match lock(&self.outbound).as_ref() {
            Some(tx) => {
                trace!("{}: queued {} bytes", self.name, bytes.len());
                tx.send(bytes).is_ok()
            }
            None => false,
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.outbound).take();
        lock(&self.proxy).take();
        self.closed_notify.notify_waiters();
        debug!("Channel {} closed", self.name);
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the channel is closed
    pub async fn closed(&self) {
        let notified = self.closed_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Relay future input to `partner`
    pub fn set_proxy(&self, partner: &Arc<Channel>) {
        *lock(&self.proxy) = Some(Arc::downgrade(partner));
    }

    /// Current proxy partner, if it is still alive
    pub fn proxy_peer(&self) -> Option<Arc<Channel>> {
        lock(&self.proxy).as_ref().and_then(Weak::upgrade)
    }

    /// Whether this channel is relaying to a partner
    pub fn is_proxied(&self) -> bool {
        self.proxy_peer().is_some()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("proxied", &self.is_proxied())
            .finish()
    }
}
