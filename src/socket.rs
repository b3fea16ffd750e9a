//! Raw socket construction, option application, and the accept syscall.
//!
//! This module is the only place in the crate that reaches for `libc`
//! directly; everywhere else talks to sockets through `mio`.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use mio::net::{TcpListener as MioTcpListener, TcpSocket};

use crate::address::{Address, Family};
use crate::error::ConfigError;
use crate::options::{self, Options};

/// Iterates candidate addresses, creating + configuring + binding + listening
/// on the first one that succeeds, exactly as described in §4.E "Bind
/// protocol": a failed `socket`/`bind` moves to the next candidate, but a
/// failed `listen` is fatal.
pub(crate) fn bind_first_candidate(
    candidates: &[Address],
    backlog: u32,
    options: Options,
) -> Result<MioTcpListener, ConfigError> {
    let mut last_err: Option<io::Error> = None;

    for candidate in candidates {
        let socket = match candidate.family() {
            Family::V4 => TcpSocket::new_v4(),
            Family::V6 => TcpSocket::new_v6(),
        };

        let socket = match socket {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        if let Err(e) = apply_pre_bind_options(&socket, options) {
            last_err = Some(e);
            continue;
        }

        if let Err(e) = socket.bind(candidate.to_socket_addr()) {
            last_err = Some(e);
            continue;
        }

        apply_post_bind_options(&socket, options);

        // `listen` is not tolerant of failure: a bound-but-unlistenable
        // socket indicates a condition (e.g. EADDRINUSE raced after bind, or
        // resource exhaustion) that should abort the whole bind attempt
        // rather than silently trying the next candidate.
        return socket
            .listen(backlog)
            .map_err(|e| ConfigError::Bind(e));
    }

    Err(last_err.map(ConfigError::Bind).unwrap_or(ConfigError::NoAddress))
}

fn apply_pre_bind_options(socket: &TcpSocket, options: Options) -> io::Result<()> {
    if options.contains(Options::REUSE_ADDR) {
        socket.set_reuseaddr(true)?;
    }
    if options.contains(Options::FAST_OPEN) {
        set_tcp_fastopen(socket_fd(socket), options::FAST_OPEN_QUEUE_LEN)?;
    }
    Ok(())
}

/// `SO_LINGER`/`TCP_NODELAY` only make sense once the socket is bound; the
/// teacher crate applies its analogous options in the same place.
fn apply_post_bind_options(socket: &TcpSocket, options: Options) {
    if options.contains(Options::LINGER) {
        let _ = set_linger(socket_fd(socket), options::LINGER_SECONDS);
    }
    if options.contains(Options::NO_DELAY) {
        let _ = set_nodelay(socket_fd(socket));
    }
}

fn socket_fd(socket: &TcpSocket) -> RawFd {
    use std::os::unix::io::AsRawFd;
    socket.as_raw_fd()
}

fn set_tcp_fastopen(fd: RawFd, queue_len: libc::c_int) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, &queue_len)
}

fn set_linger(fd: RawFd, seconds: libc::c_int) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: seconds,
    };
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &linger)
}

fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &on)
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Error returned by [`accept_raw`], distinguishing the two cases §4.E /
/// §7 call out: a dead listen socket (fatal) versus a transient accept
/// failure (recoverable).
pub(crate) enum AcceptError {
    /// `EBADF` / `ENOTSOCK`: the listen socket itself is gone.
    ListenSocketGone(io::Error),
    /// Any other `accept` failure: this one connection attempt failed.
    Transient(io::Error),
}

/// Raw, non-blocking `accept()` on `listen_fd`, returning the peer's
/// descriptor and address.
pub(crate) fn accept_raw(listen_fd: RawFd) -> Result<(RawFd, SocketAddr), AcceptError> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let fd = unsafe {
        libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EBADF) | Some(libc::ENOTSOCK) => Err(AcceptError::ListenSocketGone(err)),
            _ => Err(AcceptError::Transient(err)),
        };
    }

    match sockaddr_to_std(&storage, len) {
        Ok(addr) => Ok((fd, addr)),
        Err(e) => {
            unsafe {
                libc::close(fd);
            }
            Err(AcceptError::Transient(e))
        }
    }
}

fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sa: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sa: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported peer address family",
        )),
    }
}
