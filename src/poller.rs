use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Token};

/// An opaque 64-bit tag attached to a registration; surfaces unchanged on
/// the matching readiness event.
pub type Tag = u64;

/// Which readiness an [`Poller::add`] registration is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    fn to_mio(self) -> MioInterest {
        match self {
            Interest::Read => MioInterest::READABLE,
            Interest::Write => MioInterest::WRITABLE,
            Interest::ReadWrite => MioInterest::READABLE.add(MioInterest::WRITABLE),
        }
    }
}

/// A single readiness event handed back by [`Poller::poll`].
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub tag: Tag,
    pub readable: bool,
    pub writable: bool,
}

/// A thin readiness facade over the host OS's level-triggered notification
/// facility, backed by `mio::Poll` — the same facility the teacher crate
/// already pulls in for its own accept loop.
pub struct Poller {
    poll: mio::Poll,
    events: Events,
}

impl Poller {
    pub fn new(batch: usize) -> io::Result<Self> {
        Ok(Poller {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(batch),
        })
    }

    /// Registers `fd` for the given interest; subsequent events surface with
    /// `tag`.
    pub fn add(&self, fd: RawFd, interest: Interest, tag: Tag) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(tag as usize), interest.to_mio())
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Blocks up to `timeout` (`None` means indefinite) and returns the
    /// readiness events that arrived, `Ok(vec![])` on timeout.
    ///
    /// An `Err` with [`io::ErrorKind::Interrupted`] distinguishes an `EINTR`
    /// from every other failure, so callers can special-case "interrupted by
    /// our own cancellation path".
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self
            .events
            .iter()
            .map(|ev| ReadyEvent {
                tag: ev.token().0 as u64,
                readable: ev.is_readable(),
                writable: ev.is_writable(),
            })
            .collect())
    }
}
