//! Process-wide interrupt handling.
//!
//! Async-signal-safety forbids allocation, locks, or most library calls
//! inside a signal handler. The handler installed here does exactly two
//! signal-safe things: close a raw descriptor and write an atomic integer.
//! This is the "atomic sentinel" strategy discussed in §9 of the
//! specification; a self-pipe registered with the [`crate::poller::Poller`]
//! would remove the `EINTR` special case entirely and is the preferred
//! design for a fresh implementation, but this crate preserves the sentinel
//! approach for fidelity to what it generalizes.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// `-1` means "no listen descriptor is currently installed for the signal
/// handler to close". Written once by `bind`, taken (and closed) by whichever
/// of the signal handler or the normal shutdown path observes it first.
///
/// This is the single source of truth for "has the listen descriptor been
/// closed yet" — the signal handler and [`take_and_close`] both swap this
/// same atomic, so the descriptor is closed exactly once no matter which path
/// gets there first.
static G_LISTEN_FD: AtomicI32 = AtomicI32::new(-1);

/// Records `fd` as the descriptor the interrupt handler should close if it
/// fires. Call after a successful `bind`.
pub(crate) fn set_sentinel(fd: RawFd) {
    G_LISTEN_FD.store(fd, Ordering::SeqCst);
}

/// `true` once the registered descriptor has been taken by [`take_and_close`]
/// (from either the signal handler or the normal shutdown path).
pub(crate) fn sentinel_cleared() -> bool {
    G_LISTEN_FD.load(Ordering::SeqCst) == -1
}

/// Atomically takes whatever descriptor is currently registered (setting the
/// sentinel to `-1`) and closes it if one was present. Returns the
/// descriptor that was closed, or `-1` if none was registered.
///
/// Safe to call from both the `SIGINT` handler and the normal shutdown path:
/// whichever runs first observes the real descriptor and closes it, the
/// other observes `-1` and does nothing, so the descriptor is never closed
/// twice.
pub(crate) fn take_and_close() -> RawFd {
    let fd = G_LISTEN_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
    fd
}

extern "C" fn on_sigint(_signum: libc::c_int) {
    take_and_close();
}

/// Installs a process-wide `SIGINT` handler that closes the registered
/// listen descriptor and clears the sentinel, causing the accept loop's
/// blocked `poll`/`accept` to unblock with `EINTR`/`EBADF`.
///
/// Fallible: a failed `sigaction` call is reported to the caller rather than
/// silently ignored.
pub(crate) fn install_sigint_handler() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigint as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;

        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_close_clears_the_sentinel_and_is_idempotent() {
        // take_and_close() always calls libc::close on a non-negative
        // sentinel, so hand it a real, harmless descriptor (a dup of stdin)
        // rather than a synthetic number that might belong to something else
        // in this test process.
        let fd = unsafe { libc::dup(0) };
        assert_ne!(fd, -1);

        set_sentinel(fd);
        assert!(!sentinel_cleared());
        assert_eq!(take_and_close(), fd);
        assert!(sentinel_cleared());

        // idempotent: a second call observes -1 and does not attempt to
        // close anything (and, critically, does not report `fd` again).
        assert_eq!(take_and_close(), -1);
    }
}
