// src/syscalls.rs
//! Raw libc plumbing: the listening socket, non-blocking I/O, the epoll
//! wrapper, the signal self-pipe, and read-only file mappings. Everything
//! unsafe in the engine lives here behind small safe entry points.

use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::config::TriggerMode;
use crate::error::EmberResult;

pub const READ_EVENT: u32 = libc::EPOLLIN as u32;
pub const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;
pub const HANGUP_EVENTS: u32 =
    (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

/// Byte written to the self-pipe by workers asking the reactor to reclaim
/// a connection. Distinct from every signal number we install.
pub const RECLAIM_TOKEN: u8 = 0;

// ---- Socket operations ----

/// Create the non-blocking listener: optional SO_LINGER, SO_REUSEADDR,
/// bind 0.0.0.0:port, listen with a short backlog.
pub fn create_listen_socket(port: u16, linger: bool) -> EmberResult<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if linger {
            let opt = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &opt as *const _ as *const c_void,
                mem::size_of_val(&opt) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, 5) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept one non-blocking connection. `Ok(None)` when the accept queue
/// is drained.
pub fn accept_connection(listen_fd: c_int) -> EmberResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut addr_len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let ip = IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)));
            let peer = SocketAddr::new(ip, u16::from_be(addr.sin_port));
            Ok(Some((fd, peer)))
        }
    }
}

pub fn set_non_blocking(fd: c_int) -> EmberResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn recv_bytes(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let n = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

pub fn send_bytes(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let n = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Scatter-gather write of the header buffer plus the mapped file slice.
pub fn writev_slices(fd: c_int, first: &[u8], second: &[u8]) -> io::Result<usize> {
    let iov = [
        libc::iovec {
            iov_base: first.as_ptr() as *mut c_void,
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_ptr() as *mut c_void,
            iov_len: second.len(),
        },
    ];
    unsafe {
        let n = libc::writev(fd, iov.as_ptr(), 2);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Last-resort rejection used when the connection table is full: tell the
/// peer and close without registering anything.
pub fn show_error(fd: c_int, message: &str) {
    let _ = send_bytes(fd, message.as_bytes());
    close_fd(fd);
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Self-pipe and signals ----

static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// `socketpair` self-pipe: returns `(read_end, write_end)`, both
/// non-blocking so a burst of signals can never wedge the handler.
pub fn create_signal_pipe() -> EmberResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    set_non_blocking(fds[0])?;
    set_non_blocking(fds[1])?;
    Ok((fds[0], fds[1]))
}

extern "C" fn signal_to_pipe(sig: c_int) {
    unsafe {
        let saved_errno = *libc::__errno_location();
        let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(fd, &byte as *const u8 as *const c_void, 1, libc::MSG_NOSIGNAL);
        }
        *libc::__errno_location() = saved_errno;
    }
}

/// Route SIGALRM and SIGTERM into the pipe's write end. Other signals
/// are blocked while a handler runs; syscalls are left interruptible so
/// the reactor wakes promptly.
pub fn install_signal_handlers(pipe_wr: c_int) -> EmberResult<()> {
    SIGNAL_PIPE_WR.store(pipe_wr, Ordering::SeqCst);
    for sig in [libc::SIGALRM, libc::SIGTERM] {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = signal_to_pipe as extern "C" fn(c_int) as libc::sighandler_t;
            libc::sigfillset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
    }
    Ok(())
}

/// Write one arbitrary byte into the pipe; used for the worker-reclaim
/// token and for cooperative shutdown.
pub fn notify_pipe(pipe_wr: c_int, byte: u8) {
    unsafe {
        libc::send(
            pipe_wr,
            &byte as *const u8 as *const c_void,
            1,
            libc::MSG_NOSIGNAL,
        );
    }
}

pub fn schedule_alarm(secs: u64) {
    unsafe {
        libc::alarm(secs as libc::c_uint);
    }
}

pub fn cancel_alarm() {
    unsafe {
        libc::alarm(0);
    }
}

// ---- Epoll ----

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> EmberResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// The single place where interest masks are composed: base events,
    /// always EPOLLRDHUP, plus the trigger and one-shot options.
    fn compose(events: u32, trigger: TriggerMode, one_shot: bool) -> u32 {
        let mut composed = events | libc::EPOLLRDHUP as u32;
        if trigger == TriggerMode::Edge {
            composed |= libc::EPOLLET as u32;
        }
        if one_shot {
            composed |= libc::EPOLLONESHOT as u32;
        }
        composed
    }

    pub fn add(
        &self,
        fd: c_int,
        events: u32,
        trigger: TriggerMode,
        one_shot: bool,
    ) -> EmberResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::compose(events, trigger, one_shot))
    }

    /// One-shot rearm: no further event for `fd` can arrive until this is
    /// called by whichever thread finished with the connection.
    pub fn modify(
        &self,
        fd: c_int,
        events: u32,
        trigger: TriggerMode,
        one_shot: bool,
    ) -> EmberResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Self::compose(events, trigger, one_shot))
    }

    pub fn delete(&self, fd: c_int) -> EmberResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: c_int, events: u32) -> EmberResult<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Returns the number of ready events; an interrupted wait reports
    /// zero so the caller simply loops.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let n = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(n as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Memory-mapped files ----

/// Read-only private mapping of a regular file, unmapped on drop.
pub struct MappedFile {
    addr: *mut c_void,
    len: usize,
}

unsafe impl Send for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path, len: usize) -> EmberResult<Self> {
        use std::os::unix::ffi::OsStrExt;
        let mut bytes = path.as_os_str().as_bytes().to_vec();
        bytes.push(0);
        unsafe {
            let fd = libc::open(bytes.as_ptr() as *const libc::c_char, libc::O_RDONLY);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let addr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            );
            libc::close(fd);
            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { addr, len })
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}
