//! On-demand worker pool
//!
//! Workers are created only when a request arrives and no worker is idle.
//! They never exit while the pool is running; a finished worker returns to
//! the idle list. Completion posting, the request hand-back and the return
//! to the idle list all happen under the pool lock, so a completion observed
//! on the loop always means its worker is already reusable.

use super::executor::{BlockingExecutor, OpResult, SyscallExecutor};
use super::{AsyncRequest, Completion};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Worker thread settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix; workers are named `<prefix>-<index>`
    pub thread_name_prefix: String,
    /// Stack size for worker threads (platform default if unset)
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "asyncreq-worker".to_string(),
            stack_size: None,
        }
    }
}

enum Slot {
    /// On the idle list
    Idle,
    /// Handed a request the worker has not picked up yet
    Assigned(AsyncRequest),
    /// Running a request
    Busy,
}

struct Worker {
    slot: Slot,
    wake: Arc<Condvar>,
    thread: Option<JoinHandle<()>>,
}

struct PoolState {
    workers: Vec<Worker>,
    idle: Vec<usize>,
    shutdown: bool,
}

struct PoolShared<E> {
    state: Mutex<PoolState>,
    executor: E,
    config: PoolConfig,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Growable pool of threads running blocking calls
pub struct WorkerPool<E: BlockingExecutor = SyscallExecutor> {
    shared: Arc<PoolShared<E>>,
}

impl<E: BlockingExecutor> WorkerPool<E> {
    /// Start an empty pool
    pub fn start(config: PoolConfig, executor: E) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    idle: Vec::new(),
                    shutdown: false,
                }),
                executor,
                config,
            }),
        }
    }

    /// The executor shared by all workers
    pub fn executor(&self) -> &E {
        &self.shared.executor
    }

    /// Hand `request` to an idle worker, creating one if none is idle.
    ///
    /// If a thread cannot be created the request completes with the
    /// platform error instead.
    pub fn assign(&self, request: AsyncRequest) {
        let mut state = lock(&self.shared.state);
        if state.shutdown {
            drop(state);
            debug!("Pool is shut down, cancelling {} request", request.kind());
            request.complete(-1, Some(libc::ECANCELED));
            return;
        }

        if let Some(id) = state.idle.pop() {
            let worker = &mut state.workers[id];
            worker.slot = Slot::Assigned(request);
            worker.wake.notify_one();
            return;
        }

        let id = state.workers.len();
        let wake = Arc::new(Condvar::new());
        state.workers.push(Worker {
            slot: Slot::Assigned(request),
            wake: Arc::clone(&wake),
            thread: None,
        });

        let mut builder = thread::Builder::new().name(format!("{}-{}", self.shared.config.thread_name_prefix, id));
        if let Some(size) = self.shared.config.stack_size {
            builder = builder.stack_size(size);
        }
        let shared = Arc::clone(&self.shared);
        match builder.spawn(move || worker_main(shared, id, wake)) {
            Ok(handle) => {
                state.workers[id].thread = Some(handle);
                debug!("Started pool worker {}", id);
            }
            Err(e) => {
                let code = e.raw_os_error().unwrap_or(libc::EAGAIN);
                warn!("Failed to start pool worker: {}", e);
                if let Some(Worker {
                    slot: Slot::Assigned(request),
                    ..
                }) = state.workers.pop()
                {
                    request.complete(-1, Some(code));
                }
            }
        }
    }

    /// Threads created so far
    pub fn worker_count(&self) -> usize {
        lock(&self.shared.state).workers.len()
    }

    /// Threads waiting for work
    pub fn idle_count(&self) -> usize {
        lock(&self.shared.state).idle.len()
    }

    /// Stop accepting work and join every worker.
    ///
    /// Requests already handed to a worker still complete; later
    /// submissions complete with `ECANCELED`. Blocks until in-flight calls
    /// return.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            for worker in &state.workers {
                worker.wake.notify_one();
            }
            state.workers.iter_mut().filter_map(|w| w.thread.take()).collect()
        };

        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                error!("Pool worker panicked");
            }
        }
        if count > 0 {
            info!("Worker pool stopped, joined {} workers", count);
        }
    }
}

impl<E: BlockingExecutor> Drop for WorkerPool<E> {
    fn drop(&mut self) {
        // Wake idle workers so they exit; busy ones exit after their call.
        let mut state = lock(&self.shared.state);
        state.shutdown = true;
        for worker in &state.workers {
            worker.wake.notify_one();
        }
    }
}

fn worker_main<E: BlockingExecutor>(shared: Arc<PoolShared<E>>, id: usize, wake: Arc<Condvar>) {
    let mut state = lock(&shared.state);
    loop {
        let request = loop {
            match std::mem::replace(&mut state.workers[id].slot, Slot::Busy) {
                Slot::Assigned(request) => break request,
                other => state.workers[id].slot = other,
            }
            if state.shutdown {
                trace!("Pool worker {} exiting", id);
                return;
            }
            state = wake.wait(state).unwrap_or_else(PoisonError::into_inner);
        };
        drop(state);

        let (mut op, done) = request.into_parts();
        let kind = op.kind();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.executor.execute(&mut op)))
            .unwrap_or_else(|_| {
                error!("Executor panicked running {}", kind);
                OpResult::failed(libc::EIO)
            });
        trace!(worker = id, %kind, result = outcome.value, error = ?outcome.error, "Request finished");

        state = lock(&shared.state);
        done.schedule(Completion {
            op,
            result: outcome.value,
            error: outcome.error,
        });
        state.workers[id].slot = Slot::Idle;
        state.idle.push(id);
    }
}
