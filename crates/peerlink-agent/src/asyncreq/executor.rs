//! Platform calls behind the [`BlockingExecutor`] seam
//!
//! Every call runs on a pool worker. Return values and `errno` are passed
//! back untouched.

use super::{AsyncOp, OpKind};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Raw outcome of one platform call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpResult {
    /// Return value, unmodified
    pub value: isize,
    /// Error code captured right after the call, when it failed
    pub error: Option<i32>,
}

impl OpResult {
    /// Capture errno if `value` is the failure sentinel
    fn from_ret(value: isize) -> Self {
        let error = if value == -1 {
            Some(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            None
        };
        Self { value, error }
    }

    /// Failure without a call
    pub fn failed(error: i32) -> Self {
        Self {
            value: -1,
            error: Some(error),
        }
    }
}

/// Runs blocking operations on a worker thread
///
/// Implementations are shared by every worker of a pool.
pub trait BlockingExecutor: Send + Sync + 'static {
    /// Whether this executor knows how to run `kind`.
    /// Unrecognized kinds complete with `ENOSYS` without reaching a worker.
    fn recognizes(&self, kind: OpKind) -> bool {
        let _ = kind;
        true
    }

    /// Perform the call, writing output fields into `op`
    fn execute(&self, op: &mut AsyncOp) -> OpResult;
}

/// Executor that issues the real platform calls through `libc`
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallExecutor;

impl BlockingExecutor for SyscallExecutor {
    fn execute(&self, op: &mut AsyncOp) -> OpResult {
        match op {
            AsyncOp::Read { fd, buf } => {
                // SAFETY: the pointer and length describe `buf`, which outlives the call.
                let ret = unsafe { libc::read(*fd, buf.as_mut_ptr().cast(), buf.len()) };
                OpResult::from_ret(ret)
            }
            AsyncOp::Write { fd, buf } => {
                // SAFETY: the pointer and length describe `buf`, which outlives the call.
                let ret = unsafe { libc::write(*fd, buf.as_ptr().cast(), buf.len()) };
                OpResult::from_ret(ret)
            }
            AsyncOp::SeekRead { fd, buf, offset } => {
                let Ok(offset) = libc::off_t::try_from(*offset) else {
                    return OpResult::failed(libc::EINVAL);
                };
                // SAFETY: the pointer and length describe `buf`, which outlives the call.
                let ret = unsafe { libc::pread(*fd, buf.as_mut_ptr().cast(), buf.len(), offset) };
                OpResult::from_ret(ret)
            }
            AsyncOp::SeekWrite { fd, buf, offset } => {
                let Ok(offset) = libc::off_t::try_from(*offset) else {
                    return OpResult::failed(libc::EINVAL);
                };
                // SAFETY: the pointer and length describe `buf`, which outlives the call.
                let ret = unsafe { libc::pwrite(*fd, buf.as_ptr().cast(), buf.len(), offset) };
                OpResult::from_ret(ret)
            }
            AsyncOp::Recv { sock, buf, flags } => {
                // SAFETY: the pointer and length describe `buf`, which outlives the call.
                let ret = unsafe { libc::recv(*sock, buf.as_mut_ptr().cast(), buf.len(), *flags) };
                OpResult::from_ret(ret)
            }
            AsyncOp::Send { sock, buf, flags } => {
                // SAFETY: the pointer and length describe `buf`, which outlives the call.
                let ret = unsafe { libc::send(*sock, buf.as_ptr().cast(), buf.len(), *flags) };
                OpResult::from_ret(ret)
            }
            AsyncOp::RecvFrom {
                sock,
                buf,
                flags,
                from,
            } => {
                // SAFETY: sockaddr_storage is plain data; all-zero is valid.
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                // SAFETY: `buf` and `storage` are live for the call and `len`
                // holds the size of `storage`.
                let ret = unsafe {
                    libc::recvfrom(
                        *sock,
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        *flags,
                        (&mut storage as *mut libc::sockaddr_storage).cast(),
                        &mut len,
                    )
                };
                let result = OpResult::from_ret(ret);
                if result.error.is_none() {
                    *from = socket_addr_from_raw(&storage);
                }
                result
            }
            AsyncOp::SendTo { sock, buf, flags, to } => {
                let (storage, len) = socket_addr_to_raw(to);
                // SAFETY: `buf` is live for the call; `storage` holds a valid
                // address of `len` bytes.
                let ret = unsafe {
                    libc::sendto(
                        *sock,
                        buf.as_ptr().cast(),
                        buf.len(),
                        *flags,
                        (&storage as *const libc::sockaddr_storage).cast(),
                        len,
                    )
                };
                OpResult::from_ret(ret)
            }
            AsyncOp::Accept { sock, peer } => {
                // SAFETY: sockaddr_storage is plain data; all-zero is valid.
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                // SAFETY: `len` holds the size of `storage`, which outlives the call.
                let ret = unsafe {
                    libc::accept(*sock, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
                };
                let result = OpResult::from_ret(ret as isize);
                if result.error.is_none() {
                    *peer = socket_addr_from_raw(&storage);
                }
                result
            }
            AsyncOp::Connect { sock, addr } => {
                let (storage, len) = socket_addr_to_raw(addr);
                // SAFETY: `storage` holds a valid address of `len` bytes.
                let ret = unsafe {
                    libc::connect(*sock, (&storage as *const libc::sockaddr_storage).cast(), len)
                };
                OpResult::from_ret(ret as isize)
            }
            AsyncOp::WaitPid {
                pid,
                options,
                status,
            } => {
                // SAFETY: `status` is a valid out-pointer for the call.
                let ret = unsafe { libc::waitpid(*pid, status, *options) };
                OpResult::from_ret(ret as isize)
            }
            AsyncOp::Select {
                nfds,
                readfds,
                writefds,
                errorfds,
                timeout,
            } => {
                let mut tv = libc::timeval {
                    tv_sec: timeout.as_secs() as libc::time_t,
                    tv_usec: timeout.subsec_micros() as libc::suseconds_t,
                };
                // SAFETY: the three sets and `tv` are owned by `op` and live
                // for the call.
                let ret = unsafe {
                    libc::select(
                        *nfds,
                        readfds.as_mut_ptr(),
                        writefds.as_mut_ptr(),
                        errorfds.as_mut_ptr(),
                        &mut tv,
                    )
                };
                OpResult::from_ret(ret as isize)
            }
            AsyncOp::Close { fd } => {
                // SAFETY: closing a caller-supplied descriptor touches no memory.
                let ret = unsafe { libc::close(*fd) };
                OpResult::from_ret(ret as isize)
            }
        }
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain data and large enough for both families.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>();
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>();
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in6.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn socket_addr_from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            // SAFETY: the family tag says the storage holds a sockaddr_in.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: the family tag says the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
