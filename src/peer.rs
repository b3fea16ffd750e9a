use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use crate::address::Address;

/// An accepted client connection awaiting hand-off to a transport.
///
/// Ownership of the underlying descriptor passes to whichever transport
/// receives this `Peer` via `handle_new_peer`; the core itself never reads
/// or writes through it.
#[derive(Debug)]
pub struct Peer {
    address: Address,
    fd: RawFd,
}

impl Peer {
    pub(crate) fn new(address: Address, fd: RawFd) -> Self {
        Peer { address, fd }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Consumes the peer and returns the raw descriptor for the transport to
    /// wrap in whatever I/O type it uses (e.g. `mio::net::TcpStream` or
    /// `tokio::net::TcpStream::from_std`).
    pub fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl AsRawFd for Peer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for Peer {
    fn into_raw_fd(self) -> RawFd {
        Peer::into_raw_fd(self)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        // A peer that is dropped without being claimed by a transport (e.g.
        // the dispatcher panics before hand-off) must not leak the fd.
        unsafe {
            libc::close(self.fd);
        }
    }
}

// Safety: `Peer` only carries a raw descriptor and a plain-data address; both
// are safe to move to the worker thread that ends up owning the connection.
unsafe impl Send for Peer {}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Peer;
    use crate::address::Address;

    /// Builds a `Peer` around a descriptor that need not be a real open fd,
    /// for tests that only exercise dispatch arithmetic and never read or
    /// write through it. The descriptor is still `close`d on drop, so callers
    /// must pass a value `libc::close` tolerates (duplicating stdin/fd 0 is
    /// the simplest one that's always open).
    pub(crate) fn fake_peer(fd: i32) -> Peer {
        let dup_fd = unsafe { libc::dup(0) };
        let _ = fd;
        Peer::new(Address::default(), dup_fd)
    }
}
