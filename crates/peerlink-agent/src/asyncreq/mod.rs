//! Blocking-call bridge for the event loop
//!
//! An [`AsyncRequest`] describes one blocking platform call. Submitting it
//! through the [`AsyncDispatcher`] runs the call off the event-loop thread
//! (on a [`WorkerPool`] thread, or through the native positioned-I/O
//! strategy) and delivers exactly one [`Completion`] back onto the loop.
//!
//! Buffers are owned by the request while it is in flight and come back in
//! the completion.

use crate::event_loop::LoopHandle;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::warn;

/// Platform call executor and its trait seam
pub mod executor;

/// Growable worker thread pool
pub mod pool;

/// Public entry point and strategy selection
pub mod dispatcher;

/// io_uring positioned-I/O strategy
#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub mod uring;

pub use dispatcher::{AsyncDispatcher, DispatcherConfig, NativeIo};
pub use executor::{BlockingExecutor, OpResult, SyscallExecutor};
pub use pool::{PoolConfig, WorkerPool};

/// One blocking operation and its payload
#[derive(Debug)]
pub enum AsyncOp {
    /// `read(fd, buf)` at the current file position
    Read {
        /// File descriptor
        fd: RawFd,
        /// Destination; reads up to `buf.len()` bytes
        buf: Vec<u8>,
    },
    /// `write(fd, buf)` at the current file position
    Write {
        /// File descriptor
        fd: RawFd,
        /// Bytes to write
        buf: Vec<u8>,
    },
    /// `pread(fd, buf, offset)`
    SeekRead {
        /// File descriptor
        fd: RawFd,
        /// Destination; reads up to `buf.len()` bytes
        buf: Vec<u8>,
        /// Absolute file offset
        offset: u64,
    },
    /// `pwrite(fd, buf, offset)`
    SeekWrite {
        /// File descriptor
        fd: RawFd,
        /// Bytes to write
        buf: Vec<u8>,
        /// Absolute file offset
        offset: u64,
    },
    /// `recv(sock, buf, flags)`
    Recv {
        /// Socket descriptor
        sock: RawFd,
        /// Destination
        buf: Vec<u8>,
        /// `MSG_*` flags
        flags: i32,
    },
    /// `send(sock, buf, flags)`
    Send {
        /// Socket descriptor
        sock: RawFd,
        /// Bytes to send
        buf: Vec<u8>,
        /// `MSG_*` flags
        flags: i32,
    },
    /// `recvfrom(sock, buf, flags)`; the sender address is filled in
    RecvFrom {
        /// Socket descriptor
        sock: RawFd,
        /// Destination
        buf: Vec<u8>,
        /// `MSG_*` flags
        flags: i32,
        /// Sender, set on success when it is an IP address
        from: Option<SocketAddr>,
    },
    /// `sendto(sock, buf, flags, to)`
    SendTo {
        /// Socket descriptor
        sock: RawFd,
        /// Bytes to send
        buf: Vec<u8>,
        /// `MSG_*` flags
        flags: i32,
        /// Destination address
        to: SocketAddr,
    },
    /// `accept(sock)`; the result is the new descriptor
    Accept {
        /// Listening socket
        sock: RawFd,
        /// Remote address, set on success when it is an IP address
        peer: Option<SocketAddr>,
    },
    /// `connect(sock, addr)`
    Connect {
        /// Socket descriptor
        sock: RawFd,
        /// Remote address
        addr: SocketAddr,
    },
    /// `waitpid(pid, &status, options)`
    WaitPid {
        /// Process (or group) to wait for
        pid: i32,
        /// `WNOHANG` etc.
        options: i32,
        /// Raw wait status, set on success
        status: i32,
    },
    /// `select(nfds, read, write, error, timeout)`; the sets are updated in place
    Select {
        /// Highest descriptor plus one
        nfds: i32,
        /// Descriptors to check for readability
        readfds: FdSet,
        /// Descriptors to check for writability
        writefds: FdSet,
        /// Descriptors to check for exceptional conditions
        errorfds: FdSet,
        /// Upper bound on the wait
        timeout: Duration,
    },
    /// `close(fd)`
    Close {
        /// File descriptor
        fd: RawFd,
    },
}

/// Tag identifying an [`AsyncOp`] case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// [`AsyncOp::Read`]
    Read,
    /// [`AsyncOp::Write`]
    Write,
    /// [`AsyncOp::SeekRead`]
    SeekRead,
    /// [`AsyncOp::SeekWrite`]
    SeekWrite,
    /// [`AsyncOp::Recv`]
    Recv,
    /// [`AsyncOp::Send`]
    Send,
    /// [`AsyncOp::RecvFrom`]
    RecvFrom,
    /// [`AsyncOp::SendTo`]
    SendTo,
    /// [`AsyncOp::Accept`]
    Accept,
    /// [`AsyncOp::Connect`]
    Connect,
    /// [`AsyncOp::WaitPid`]
    WaitPid,
    /// [`AsyncOp::Select`]
    Select,
    /// [`AsyncOp::Close`]
    Close,
}

impl OpKind {
    /// Every kind, in declaration order
    pub const ALL: [OpKind; 13] = [
        OpKind::Read,
        OpKind::Write,
        OpKind::SeekRead,
        OpKind::SeekWrite,
        OpKind::Recv,
        OpKind::Send,
        OpKind::RecvFrom,
        OpKind::SendTo,
        OpKind::Accept,
        OpKind::Connect,
        OpKind::WaitPid,
        OpKind::Select,
        OpKind::Close,
    ];

    /// Read or write at an explicit offset
    pub fn is_positioned(self) -> bool {
        matches!(self, OpKind::SeekRead | OpKind::SeekWrite)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::SeekRead => "pread",
            OpKind::SeekWrite => "pwrite",
            OpKind::Recv => "recv",
            OpKind::Send => "send",
            OpKind::RecvFrom => "recvfrom",
            OpKind::SendTo => "sendto",
            OpKind::Accept => "accept",
            OpKind::Connect => "connect",
            OpKind::WaitPid => "waitpid",
            OpKind::Select => "select",
            OpKind::Close => "close",
        };
        f.write_str(name)
    }
}

impl AsyncOp {
    /// Which case this is
    pub fn kind(&self) -> OpKind {
        match self {
            AsyncOp::Read { .. } => OpKind::Read,
            AsyncOp::Write { .. } => OpKind::Write,
            AsyncOp::SeekRead { .. } => OpKind::SeekRead,
            AsyncOp::SeekWrite { .. } => OpKind::SeekWrite,
            AsyncOp::Recv { .. } => OpKind::Recv,
            AsyncOp::Send { .. } => OpKind::Send,
            AsyncOp::RecvFrom { .. } => OpKind::RecvFrom,
            AsyncOp::SendTo { .. } => OpKind::SendTo,
            AsyncOp::Accept { .. } => OpKind::Accept,
            AsyncOp::Connect { .. } => OpKind::Connect,
            AsyncOp::WaitPid { .. } => OpKind::WaitPid,
            AsyncOp::Select { .. } => OpKind::Select,
            AsyncOp::Close { .. } => OpKind::Close,
        }
    }

    /// The data buffer, for kinds that carry one
    pub fn buf(&self) -> Option<&[u8]> {
        match self {
            AsyncOp::Read { buf, .. }
            | AsyncOp::Write { buf, .. }
            | AsyncOp::SeekRead { buf, .. }
            | AsyncOp::SeekWrite { buf, .. }
            | AsyncOp::Recv { buf, .. }
            | AsyncOp::Send { buf, .. }
            | AsyncOp::RecvFrom { buf, .. }
            | AsyncOp::SendTo { buf, .. } => Some(buf),
            _ => None,
        }
    }

    /// Take the data buffer back, for kinds that carry one
    pub fn into_buf(self) -> Option<Vec<u8>> {
        match self {
            AsyncOp::Read { buf, .. }
            | AsyncOp::Write { buf, .. }
            | AsyncOp::SeekRead { buf, .. }
            | AsyncOp::SeekWrite { buf, .. }
            | AsyncOp::Recv { buf, .. }
            | AsyncOp::Send { buf, .. }
            | AsyncOp::RecvFrom { buf, .. }
            | AsyncOp::SendTo { buf, .. } => Some(buf),
            _ => None,
        }
    }
}

/// Descriptor set for [`AsyncOp::Select`]
#[derive(Clone, Copy)]
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    /// Empty set
    pub fn new() -> Self {
        // SAFETY: fd_set is plain data; FD_ZERO initializes it.
        let mut raw: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut raw) };
        Self { raw }
    }

    fn in_range(fd: RawFd) -> bool {
        fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize
    }

    /// Add `fd`; descriptors outside `0..FD_SETSIZE` are ignored
    pub fn insert(&mut self, fd: RawFd) -> bool {
        if !Self::in_range(fd) {
            return false;
        }
        // SAFETY: `fd` is within FD_SETSIZE.
        unsafe { libc::FD_SET(fd, &mut self.raw) };
        true
    }

    /// Remove `fd`
    pub fn remove(&mut self, fd: RawFd) {
        if Self::in_range(fd) {
            // SAFETY: `fd` is within FD_SETSIZE.
            unsafe { libc::FD_CLR(fd, &mut self.raw) };
        }
    }

    /// Whether `fd` is in the set
    pub fn contains(&self, fd: RawFd) -> bool {
        // SAFETY: FD_ISSET only runs once `fd` is known to be in range.
        Self::in_range(fd) && unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = libc::FD_SETSIZE as RawFd;
        f.debug_set()
            .entries((0..limit).filter(|&fd| self.contains(fd)))
            .finish()
    }
}

/// Outcome of a finished request
#[derive(Debug)]
pub struct Completion {
    /// The operation, with output fields and buffer filled in
    pub op: AsyncOp,
    /// Return value of the platform call, unmodified (`-1` on failure)
    pub result: isize,
    /// Platform error code when the call failed
    pub error: Option<i32>,
}

impl Completion {
    /// Whether the call succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The error as an `io::Error`
    pub fn io_error(&self) -> Option<std::io::Error> {
        self.error.map(std::io::Error::from_raw_os_error)
    }
}

type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Continuation that runs once, on the event loop, when a request finishes
pub struct CompletionHandle {
    loop_handle: LoopHandle,
    callback: CompletionFn,
}

impl CompletionHandle {
    /// Bind `callback` to the loop behind `loop_handle`
    pub fn new<F>(loop_handle: &LoopHandle, callback: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self {
            loop_handle: loop_handle.clone(),
            callback: Box::new(callback),
        }
    }

    /// Schedule the callback onto the loop. Consumes the handle.
    pub(crate) fn schedule(self, completion: Completion) {
        let callback = self.callback;
        let kind = completion.op.kind();
        if !self.loop_handle.post(move || callback(completion)) {
            warn!("Event loop is gone, dropping {} completion", kind);
        }
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle").finish_non_exhaustive()
    }
}

/// A blocking operation plus the continuation that receives its outcome
#[derive(Debug)]
pub struct AsyncRequest {
    op: AsyncOp,
    done: CompletionHandle,
}

impl AsyncRequest {
    /// Build a request whose completion runs `callback` on the loop
    pub fn new<F>(op: AsyncOp, loop_handle: &LoopHandle, callback: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self {
            op,
            done: CompletionHandle::new(loop_handle, callback),
        }
    }

    /// Reassemble a request from its parts
    pub fn from_parts(op: AsyncOp, done: CompletionHandle) -> Self {
        Self { op, done }
    }

    /// Split into the operation and its continuation
    pub fn into_parts(self) -> (AsyncOp, CompletionHandle) {
        (self.op, self.done)
    }

    /// Operation kind
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    /// The operation
    pub fn op(&self) -> &AsyncOp {
        &self.op
    }

    /// Finish without running the operation
    pub(crate) fn complete(self, result: isize, error: Option<i32>) {
        let (op, done) = self.into_parts();
        done.schedule(Completion { op, result, error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_kind_matches_variant() {
        let op = AsyncOp::SeekRead {
            fd: 3,
            buf: vec![0; 8],
            offset: 16,
        };
        assert_eq!(op.kind(), OpKind::SeekRead);
        assert!(op.kind().is_positioned());
        assert!(!OpKind::Read.is_positioned());
        assert_eq!(op.buf().map(<[u8]>::len), Some(8));
        assert_eq!(OpKind::WaitPid.to_string(), "waitpid");
    }

    #[test]
    fn test_fd_set() {
        let mut set = FdSet::new();
        assert!(set.insert(5));
        assert!(set.contains(5));
        assert!(!set.contains(6));
        assert!(!set.insert(-1));
        set.remove(5);
        assert!(!set.contains(5));
        assert_eq!(format!("{:?}", set), "{}");
    }

    #[test]
    fn test_complete_without_running() {
        let mut event_loop = EventLoop::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let request = AsyncRequest::new(AsyncOp::Close { fd: 7 }, &event_loop.handle(), move |c| {
            *s.lock().unwrap() = Some((c.result, c.error));
        });

        request.complete(-1, Some(libc::ENOSYS));
        assert_eq!(event_loop.run_pending(), 1);
        assert_eq!(*seen.lock().unwrap(), Some((-1, Some(libc::ENOSYS))));
    }
}
