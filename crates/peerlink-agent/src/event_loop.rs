//! Single-threaded event loop and its cross-thread posting handle
//!
//! All protocol logic runs on the thread that drives the [`EventLoop`].
//! Worker threads and library-managed completion threads reach that thread
//! only through [`LoopHandle::post`].

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// A unit of work scheduled onto the loop
pub type LoopEvent = Box<dyn FnOnce() + Send + 'static>;

/// Receiving side of the loop; owned by the event-loop thread
pub struct EventLoop {
    tx: mpsc::UnboundedSender<LoopEvent>,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
}

/// Thread-safe handle for scheduling work onto an [`EventLoop`]
#[derive(Clone, Debug)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl LoopHandle {
    /// Schedule `event` to run on the loop thread.
    ///
    /// Never blocks. Returns `false` if the loop has been dropped, in which
    /// case `event` is dropped without running.
    pub fn post<F>(&self, event: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(event)).is_ok()
    }

    /// Whether the loop is still accepting events
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create an empty loop
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Handle for posting onto this loop
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next event and run it
    pub async fn next(&mut self) {
        // The loop keeps its own sender, so recv() only returns None
        // after close(), which we never call.
        if let Some(event) = self.rx.recv().await {
            event();
        }
    }

    /// Run every event already queued without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(event) = self.rx.try_recv() {
            event();
            ran += 1;
        }
        if ran > 0 {
            trace!("Ran {} pending loop events", ran);
        }
        ran
    }

    /// Block the calling thread until one event arrives, then run it.
    ///
    /// Must not be called from inside an async runtime.
    pub fn block_next(&mut self) -> bool {
        match self.rx.blocking_recv() {
            Some(event) => {
                event();
                true
            }
            None => false,
        }
    }

    /// Drive events until `shutdown` fires
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) {
        debug!("Event loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.rx.recv() => event(),
            }
        }
        let drained = self.run_pending();
        debug!("Event loop stopped, drained {} events", drained);
    }
}
