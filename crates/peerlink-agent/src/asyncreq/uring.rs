//! Positioned reads and writes through io_uring
//!
//! Submissions go straight to the ring from the submitting thread. A reaper
//! thread owns the completion queue and posts each result to the loop.

use super::dispatcher::NativeIo;
use super::{AsyncOp, AsyncRequest, Completion, CompletionHandle};
use io_uring::{opcode, squeue, types, IoUring};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Reserved `user_data` for the shutdown wake-up
const WAKE_TOKEN: u64 = u64::MAX;

/// Transient `io_uring_enter` failures retried before giving up
const MAX_SUBMIT_RETRIES: u32 = 1024;

struct InFlight {
    op: AsyncOp,
    done: CompletionHandle,
}

struct UringShared {
    ring: IoUring,
    /// Serializes every submission-queue user
    sq_lock: Mutex<()>,
    /// Requests whose buffers the kernel may still be touching
    inflight: Mutex<HashMap<u64, InFlight>>,
    next_token: AtomicU64,
    shutdown: AtomicBool,
    /// Set after a hard submit failure; the ring is not entered again
    broken: AtomicBool,
}

// SAFETY: the submission queue is only touched under `sq_lock` and the
// completion queue only by the reaper thread. Buffers referenced by queued
// entries live in `inflight` until their completion is reaped.
unsafe impl Send for UringShared {}
unsafe impl Sync for UringShared {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINTR | libc::EAGAIN | libc::EBUSY))
}

/// Call `submit` until the kernel takes the queued entries, retrying
/// transient failures.
fn submit_until_consumed<F>(mut submit: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<usize>,
{
    let mut retries = 0;
    loop {
        match submit() {
            Ok(_) => return Ok(()),
            Err(e) if is_transient(&e) && retries < MAX_SUBMIT_RETRIES => {
                retries += 1;
                thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
}

impl UringShared {
    /// Queue `entry` and submit it. `EAGAIN` means the submission queue
    /// was full and nothing was queued.
    fn push(&self, entry: &squeue::Entry) -> io::Result<()> {
        let _sq = lock(&self.sq_lock);
        if self.broken.load(Ordering::Acquire) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        // SAFETY: sq_lock is held, and the caller keeps the entry's buffer
        // alive in `inflight` until it completes.
        let pushed = unsafe {
            let mut sq = self.ring.submission_shared();
            let pushed = sq.push(entry).is_ok();
            sq.sync();
            pushed
        };
        if !pushed {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        submit_until_consumed(|| self.ring.submit()).map_err(|e| {
            error!("io_uring submit failed, disabling ring: {}", e);
            self.broken.store(true, Ordering::Release);
            e
        })
    }
}

/// Native strategy for [`AsyncOp::SeekRead`] and [`AsyncOp::SeekWrite`]
pub struct UringIo {
    shared: Arc<UringShared>,
    reaper: Option<JoinHandle<()>>,
}

impl UringIo {
    /// Set up a ring with `entries` submission slots and start its reaper
    pub fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        let shared = Arc::new(UringShared {
            ring,
            sq_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });

        let reaper_shared = Arc::clone(&shared);
        let reaper = thread::Builder::new()
            .name("asyncreq-uring".to_string())
            .spawn(move || reap(reaper_shared))?;
        debug!("io_uring ready with {} entries", entries);

        Ok(Self {
            shared,
            reaper: Some(reaper),
        })
    }
}

impl NativeIo for UringIo {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn submit(&self, request: AsyncRequest) -> Result<(), AsyncRequest> {
        if self.shared.broken.load(Ordering::Acquire) {
            return Err(request);
        }
        let (mut op, done) = request.into_parts();
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);

        let entry = match &mut op {
            AsyncOp::SeekRead { fd, buf, offset } if buf.len() <= u32::MAX as usize => Some(
                opcode::Read::new(types::Fd(*fd), buf.as_mut_ptr(), buf.len() as u32)
                    .offset(*offset)
                    .build(),
            ),
            AsyncOp::SeekWrite { fd, buf, offset } if buf.len() <= u32::MAX as usize => Some(
                opcode::Write::new(types::Fd(*fd), buf.as_ptr(), buf.len() as u32)
                    .offset(*offset)
                    .build(),
            ),
            _ => None,
        };
        let Some(entry) = entry else {
            return Err(AsyncRequest::from_parts(op, done));
        };
        let entry = entry.user_data(token);

        lock(&self.shared.inflight).insert(token, InFlight { op, done });
        if let Err(e) = self.shared.push(&entry) {
            let code = e.raw_os_error().unwrap_or(libc::EIO);
            if let Some(InFlight { op, done }) = lock(&self.shared.inflight).remove(&token) {
                done.schedule(Completion {
                    op,
                    result: -1,
                    error: Some(code),
                });
            }
        }
        Ok(())
    }
}

impl Drop for UringIo {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let nop = opcode::Nop::new().build().user_data(WAKE_TOKEN);
        let woken = self.shared.push(&nop).is_ok();
        if let Some(reaper) = self.reaper.take() {
            if woken {
                if reaper.join().is_err() {
                    error!("io_uring reaper panicked");
                }
            } else {
                warn!("Could not wake io_uring reaper, detaching it");
            }
        }
    }
}

fn reap(shared: Arc<UringShared>) {
    loop {
        if shared.broken.load(Ordering::Acquire) {
            fail_all(&shared, libc::EBADF);
            return;
        }
        if let Err(e) = shared.ring.submitter().submit_and_wait(1) {
            // A busy ring still has completions to drain below
            if !is_transient(&e) {
                error!("io_uring wait failed: {}", e);
                shared.broken.store(true, Ordering::Release);
                fail_all(&shared, e.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        }

        // SAFETY: this thread is the only completion-queue consumer.
        let ready: Vec<(u64, i32)> = unsafe { shared.ring.completion_shared() }
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        for (token, res) in ready {
            if token == WAKE_TOKEN {
                continue;
            }
            let Some(InFlight { op, done }) = lock(&shared.inflight).remove(&token) else {
                warn!("io_uring completion for unknown token {}", token);
                continue;
            };
            let (result, error) = if res < 0 {
                (-1, Some(-res))
            } else {
                (res as isize, None)
            };
            done.schedule(Completion { op, result, error });
        }

        if shared.shutdown.load(Ordering::Acquire) && lock(&shared.inflight).is_empty() {
            debug!("io_uring reaper exiting");
            return;
        }
    }
}

fn fail_all(shared: &UringShared, code: i32) {
    let pending: Vec<InFlight> = lock(&shared.inflight).drain().map(|(_, v)| v).collect();
    for InFlight { op, done } in pending {
        done.schedule(Completion {
            op,
            result: -1,
            error: Some(code),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_submit_retries_transient_errors() {
        let mut script = vec![
            Err(io::Error::from_raw_os_error(libc::EBUSY)),
            Err(io::Error::from_raw_os_error(libc::EINTR)),
            Err(io::Error::from_raw_os_error(libc::EAGAIN)),
            Ok(1),
        ]
        .into_iter();
        let mut calls = 0;
        let result = submit_until_consumed(|| {
            calls += 1;
            script.next().unwrap()
        });
        assert!(result.is_ok());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_submit_reports_hard_error() {
        let mut calls = 0;
        let result = submit_until_consumed(|| {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::EBADF))
        });
        assert_eq!(result.unwrap_err().raw_os_error(), Some(libc::EBADF));
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result = submit_until_consumed(|| {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::EBUSY))
        });
        assert_eq!(result.unwrap_err().raw_os_error(), Some(libc::EBUSY));
        assert_eq!(calls, MAX_SUBMIT_RETRIES + 1);
    }

    fn ring() -> Option<UringIo> {
        // Kernels or sandboxes without io_uring skip these tests
        UringIo::new(8).ok()
    }

    #[test]
    fn test_positioned_read() {
        let Some(uring) = ring() else { return };
        let mut event_loop = EventLoop::new();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let got = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        let op = AsyncOp::SeekRead {
            fd: file.as_raw_fd(),
            buf: vec![0; 4],
            offset: 3,
        };
        let request = AsyncRequest::new(op, &event_loop.handle(), move |c| {
            *g.lock().unwrap() = Some((c.result, c.op.into_buf()));
        });
        assert!(uring.submit(request).is_ok());
        assert!(event_loop.block_next());

        let (result, buf) = got.lock().unwrap().take().unwrap();
        assert_eq!(result, 4);
        assert_eq!(buf.unwrap(), b"3456");
    }

    #[test]
    fn test_positioned_write() {
        let Some(uring) = ring() else { return };
        let mut event_loop = EventLoop::new();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"..........").unwrap();

        let op = AsyncOp::SeekWrite {
            fd: file.as_raw_fd(),
            buf: b"ab".to_vec(),
            offset: 4,
        };
        let request = AsyncRequest::new(op, &event_loop.handle(), |c| assert_eq!(c.result, 2));
        assert!(uring.submit(request).is_ok());
        assert!(event_loop.block_next());

        let mut contents = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "....ab....");
    }

    #[test]
    fn test_bad_descriptor() {
        let Some(uring) = ring() else { return };
        let mut event_loop = EventLoop::new();
        let got = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        let op = AsyncOp::SeekRead {
            fd: -1,
            buf: vec![0; 4],
            offset: 0,
        };
        let request = AsyncRequest::new(op, &event_loop.handle(), move |c| {
            *g.lock().unwrap() = Some((c.result, c.error));
        });
        assert!(uring.submit(request).is_ok());
        assert!(event_loop.block_next());
        assert_eq!(got.lock().unwrap().take(), Some((-1, Some(libc::EBADF))));
    }

    #[test]
    fn test_other_kinds_are_declined() {
        let Some(uring) = ring() else { return };
        let event_loop = EventLoop::new();
        let request = AsyncRequest::new(AsyncOp::Close { fd: 0 }, &event_loop.handle(), |_| {});
        assert!(uring.submit(request).is_err());
    }
}
