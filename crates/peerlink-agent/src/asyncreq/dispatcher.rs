//! Request routing: native positioned I/O first, the worker pool otherwise

use super::executor::{BlockingExecutor, SyscallExecutor};
use super::pool::{PoolConfig, WorkerPool};
use super::AsyncRequest;
use tracing::{debug, trace};

/// Platform-native completion strategy for some request kinds
pub trait NativeIo: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Take ownership of `request` and arrange exactly one completion,
    /// or hand it back untouched if this strategy does not handle it.
    fn submit(&self, request: AsyncRequest) -> Result<(), AsyncRequest>;
}

/// Settings for [`AsyncDispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker pool settings
    pub pool: PoolConfig,
    /// Use the native positioned-I/O strategy when the platform has one
    pub native_io: bool,
    /// Submission queue depth for the native strategy
    pub native_queue_depth: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            native_io: true,
            native_queue_depth: 64,
        }
    }
}

/// Entry point for running blocking operations off the event loop
pub struct AsyncDispatcher<E: BlockingExecutor = SyscallExecutor> {
    pool: WorkerPool<E>,
    native: Option<Box<dyn NativeIo>>,
}

impl AsyncDispatcher<SyscallExecutor> {
    /// Dispatcher issuing real platform calls
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_executor(config, SyscallExecutor)
    }
}

impl<E: BlockingExecutor> AsyncDispatcher<E> {
    /// Dispatcher over a custom executor
    pub fn with_executor(config: DispatcherConfig, executor: E) -> Self {
        let native = if config.native_io {
            native_strategy(&config)
        } else {
            None
        };
        Self {
            pool: WorkerPool::start(config.pool, executor),
            native,
        }
    }

    /// Dispatcher with an explicit native strategy
    pub fn with_native(config: DispatcherConfig, executor: E, native: Box<dyn NativeIo>) -> Self {
        Self {
            pool: WorkerPool::start(config.pool, executor),
            native: Some(native),
        }
    }

    /// Start `request`. Never blocks on the operation itself.
    ///
    /// Exactly one completion is posted to the request's loop: the
    /// operation's outcome, `ENOSYS` for a kind the executor does not
    /// recognize, or the error that prevented starting it.
    pub fn submit(&self, request: AsyncRequest) {
        let kind = request.kind();
        if !self.pool.executor().recognizes(kind) {
            debug!("Unsupported request kind {}", kind);
            request.complete(-1, Some(libc::ENOSYS));
            return;
        }

        let request = match &self.native {
            Some(native) if kind.is_positioned() => match native.submit(request) {
                Ok(()) => {
                    trace!("{} submitted via {}", kind, native.name());
                    return;
                }
                Err(request) => request,
            },
            _ => request,
        };
        trace!("{} submitted to worker pool", kind);
        self.pool.assign(request);
    }

    /// Name of the active native strategy, if any
    pub fn native_name(&self) -> Option<&'static str> {
        self.native.as_ref().map(|n| n.name())
    }

    /// Worker threads created so far
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Worker threads waiting for work
    pub fn idle_count(&self) -> usize {
        self.pool.idle_count()
    }

    /// Join the worker pool; see [`WorkerPool::shutdown`]
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
fn native_strategy(config: &DispatcherConfig) -> Option<Box<dyn NativeIo>> {
    match super::uring::UringIo::new(config.native_queue_depth) {
        Ok(uring) => Some(Box::new(uring)),
        Err(e) => {
            debug!("io_uring unavailable, positioned I/O uses the worker pool: {}", e);
            None
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "io-uring")))]
fn native_strategy(_config: &DispatcherConfig) -> Option<Box<dyn NativeIo>> {
    None
}
