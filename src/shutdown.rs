use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::{Token, Waker};

use crate::poller::{Poller, Tag};

/// A one-shot, poll-registerable wakeup used to unblock the accept loop from
/// another thread, backed by `mio::Waker` (itself a self-pipe/eventfd
/// abstraction — precisely the primitive §9 of the specification asks for).
pub struct ShutdownNotifier {
    tag: Tag,
    waker: Arc<std::sync::Mutex<Option<Waker>>>,
    fired: Arc<AtomicBool>,
}

impl ShutdownNotifier {
    pub fn new(tag: Tag) -> Self {
        ShutdownNotifier {
            tag,
            waker: Arc::new(std::sync::Mutex::new(None)),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Registers this notifier with `poller`. Idempotent.
    pub fn bind(&self, poller: &Poller) -> io::Result<()> {
        let mut guard = self.waker.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let waker = Waker::new(poller.registry(), Token(self.tag as usize))?;
        *guard = Some(waker);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.waker.lock().unwrap().is_some()
    }

    /// Fires the wakeup. Idempotent and safe to call from any thread,
    /// including one unwinding from a signal.
    pub fn notify(&self) -> io::Result<()> {
        self.fired.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            waker.wake()?;
        }
        Ok(())
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Clone for ShutdownNotifier {
    fn clone(&self) -> Self {
        ShutdownNotifier {
            tag: self.tag,
            waker: self.waker.clone(),
            fired: self.fired.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Interest;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    #[test]
    fn notify_wakes_poll() {
        let mut poller = Poller::new(16).unwrap();
        let notifier = ShutdownNotifier::new(99);
        notifier.bind(&poller).unwrap();
        assert!(notifier.is_bound());

        // register something else too, so the poller isn't trivially empty
        let lst = TcpListener::bind("127.0.0.1:0").unwrap();
        lst.set_nonblocking(true).unwrap();
        poller.add(lst.as_raw_fd(), Interest::Read, lst.as_raw_fd() as u64).unwrap();

        let notifier2 = notifier.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            notifier2.notify().unwrap();
        });

        let events = poller.poll(None).unwrap();
        assert!(events.iter().any(|e| e.tag == 99));
        assert!(notifier.has_fired());
        handle.join().unwrap();
    }
}
