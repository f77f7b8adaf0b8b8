//! Networking collaborator: descriptor-level socket operations.
//!
//! Socket setup (create/bind/listen/connect, options) goes through
//! `socket2`; the data path stays on raw `libc` calls because the flag
//! arguments (`MSG_NOSIGNAL`, `MSG_MORE`) matter there. Everything is
//! non-blocking; callers see `WouldBlock` instead of stalls.

use std::io;
use std::mem::ManuallyDrop;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};

const LISTEN_BACKLOG: i32 = 512;

/// Options for [`listen`](crate::EventLoop::listen).
#[derive(Clone, Copy, Debug, Default)]
pub struct ListenOptions {
    /// Allow multiple listeners to share the port (`SO_REUSEPORT`).
    pub reuse_port: bool,
}

fn resolve(host: Option<&str>, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = match host {
        Some(host) => (host, port)
            .to_socket_addrs()
            .map_err(Error::Io)?
            .collect(),
        None => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)],
    };
    if addrs.is_empty() {
        return Err(Error::Resolve(host.unwrap_or("*").to_owned()));
    }
    Ok(addrs)
}

fn new_stream_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create a bound, listening, non-blocking socket. `None` host binds the
/// wildcard address. Returns the raw descriptor, owned by the caller.
pub fn create_listen_socket(host: Option<&str>, port: u16, options: ListenOptions) -> Result<RawFd> {
    let mut last_err = None;
    for addr in resolve(host, port)? {
        let attempt = || -> io::Result<RawFd> {
            let socket = new_stream_socket(&addr)?;
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            if options.reuse_port {
                socket.set_reuse_port(true)?;
            }
            socket.bind(&SockAddr::from(addr))?;
            socket.listen(LISTEN_BACKLOG)?;
            Ok(socket.into_raw_fd())
        };
        match attempt() {
            Ok(fd) => return Ok(fd),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no bindable address")
    })))
}

/// Resolve `host` and start a non-blocking connect. `EINPROGRESS` is the
/// expected outcome; completion (or failure) is reported by the first
/// write-readiness event on the descriptor.
pub fn connect_to_host(host: &str, port: u16) -> Result<RawFd> {
    let mut last_err = None;
    for addr in resolve(Some(host), port)? {
        let attempt = || -> io::Result<RawFd> {
            let socket = new_stream_socket(&addr)?;
            match socket.connect(&SockAddr::from(addr)) {
                Ok(()) => {}
                Err(e)
                    if e.raw_os_error() == Some(libc::EINPROGRESS)
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            Ok(socket.into_raw_fd())
        };
        match attempt() {
            Ok(fd) => return Ok(fd),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no connectable address")
    })))
}

/// Accept one pending connection, returning the non-blocking descriptor.
/// `WouldBlock` means the backlog is drained for this readiness event.
pub fn accept_connection(listener: RawFd) -> io::Result<RawFd> {
    #[cfg(target_os = "linux")]
    {
        let fd = unsafe {
            libc::accept4(
                listener,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let fd = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let socket = ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) });
        socket.set_nonblocking(true)?;
        Ok(fd)
    }
}

/// Best-effort non-blocking send. `more` is the cork hint (`MSG_MORE` on
/// Linux, ignored elsewhere).
pub fn send(fd: RawFd, buf: &[u8], more: bool) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL | if more { libc::MSG_MORE } else { 0 };
    #[cfg(not(target_os = "linux"))]
    let flags = {
        let _ = more;
        0
    };

    let ret = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Push out data held back by prior `MSG_MORE` hints. Turning `TCP_CORK`
/// off forces the partial frame onto the wire; corking stays per-send
/// (`MSG_MORE`), so the option is left off. No-op outside Linux, where
/// the hint is ignored to begin with.
pub fn flush_cork(fd: RawFd) {
    #[cfg(target_os = "linux")]
    unsafe {
        let off: libc::c_int = 0;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &off as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    #[cfg(not(target_os = "linux"))]
    let _ = fd;
}

/// Half-close: no more data will be sent, reads stay open.
pub fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Consume a pending asynchronous error (`SO_ERROR`), as left behind by a
/// failed non-blocking connect.
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let socket = ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) });
    socket.take_error()
}

pub fn local_port(fd: RawFd) -> io::Result<u16> {
    let socket = ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) });
    let addr = socket.local_addr()?;
    addr.as_socket()
        .map(|a| a.port())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an inet socket"))
}

pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
