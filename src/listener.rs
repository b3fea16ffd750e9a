//! Owns the listening socket, configuration, and reactor lifecycle; runs the
//! accept loop.

use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::future::join_all;
use log::{error, info, trace, warn};
use tokio::sync::oneshot;

use crate::address::{self, Address};
use crate::error::{ConfigError, ServerError};
use crate::load::{self, Load};
use crate::options::Options;
use crate::peer::Peer;
use crate::poller::{Interest, Poller};
use crate::reactor::{HandlerKey, Reactor};
use crate::shutdown::ShutdownNotifier;
use crate::signal;
use crate::socket::{self, AcceptError};
use crate::transport::{HandlerFactory, Transport};

/// Kernel-side backlog depth used when the caller does not call `init`.
pub const MAX_BACKLOG: u32 = 1024;

/// Worker count used when the caller does not call `init`.
pub fn default_workers() -> usize {
    num_cpus::get()
}

const SHUTDOWN_TAG: u64 = u64::MAX;

/// Abstracts over a registered handler kind's concrete `Transport` type so
/// `Listener` itself does not need to be generic — only the closure captured
/// by `set_handler` knows `T`.
trait HandlerOps: Send {
    fn dispatch(&self, reactor: &Reactor, peer: Peer) -> Result<(), ServerError>;
    fn request_usages(
        &self,
        reactor: &Reactor,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<crate::transport::ResourceUsage>>> + Send>>;
}

use std::future::Future;
use std::pin::Pin;

struct TypedHandlerOps<T> {
    key: HandlerKey<T>,
}

impl<T: Transport> HandlerOps for TypedHandlerOps<T> {
    fn dispatch(&self, reactor: &Reactor, peer: Peer) -> Result<(), ServerError> {
        let handlers = reactor.handlers(self.key);
        if handlers.is_empty() {
            return Err(ServerError::Server(io::Error::new(
                io::ErrorKind::Other,
                "dispatch_peer called with no registered handler instances",
            )));
        }
        let idx = (peer.fd() as usize) % handlers.len();
        handlers[idx].handle_new_peer(peer);
        Ok(())
    }

    fn request_usages(
        &self,
        reactor: &Reactor,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<crate::transport::ResourceUsage>>> + Send>> {
        let handlers = reactor.handlers(self.key);
        Box::pin(async move {
            // Call `load()` on every handler before awaiting any of them —
            // each call enqueues its request on that worker's channel
            // synchronously, so collecting first fires every worker's
            // request at (approximately) the same instant instead of
            // serializing worker i's request behind worker i-1's reply.
            let futures: Vec<_> = handlers.iter().map(|h| h.load()).collect();
            let usages: Result<Vec<_>, _> = join_all(futures).await.into_iter().collect();
            usages
        })
    }
}

/// A closure, captured at `set_handler` time, that finishes registering the
/// handler kind once `worker_count` is known (at `bind`) and returns the
/// type-erased ops table for it.
type HandlerSetup = dyn FnOnce(&mut Reactor) -> Box<dyn HandlerOps> + Send;

struct ListenerInner {
    address: Mutex<Address>,
    backlog: AtomicU32,
    options: Mutex<Options>,
    worker_count: AtomicUsize,

    handler_setup: Mutex<Option<Box<HandlerSetup>>>,
    handler_ops: Mutex<Option<Box<dyn HandlerOps>>>,

    reactor: Mutex<Reactor>,
    notifier: ShutdownNotifier,
    last_load: Mutex<Load>,

    listen_fd: AtomicI32,
    bound: AtomicBool,

    accept_thread: Mutex<Option<JoinHandle<Result<(), ServerError>>>>,
}

impl ListenerInner {
    /// Fires the shutdown notifier and joins the accept thread, if one was
    /// spawned via `run_threaded`. Idempotent — a second call observes
    /// `bound` already `false` and does nothing. Shared between
    /// `Listener::shutdown()` and this struct's `Drop` impl, per SPEC_FULL
    /// §3's "the accept thread, if used, lives between `run_threaded` and the
    /// destructor's join".
    fn notify_and_join(&self) {
        if !self.bound.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.notifier.notify();
        info!("shutdown requested");

        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            if handle.thread().id() == std::thread::current().id() {
                // This `ListenerInner` is being dropped from within the
                // accept thread itself (its own `Listener` clone, captured by
                // `run_threaded`, was the last strong reference) — joining
                // our own thread would deadlock, so let it finish unwinding
                // on its own instead.
                return;
            }
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("accept loop returned an error during shutdown: {}", e),
                Err(_) => error!("accept thread panicked"),
            }
        }
    }
}

/// A cheaply-`Clone`-able handle onto the connection acceptance core.
///
/// `Listener` owns the listening socket, the configuration supplied before
/// `bind`, and the [`Reactor`] it drives. Cloning shares the same underlying
/// state — this is what lets `get_port`, `shutdown`, and `request_load` be
/// called from a thread other than the one running `run`.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// An unbound listener with defaults `{ backlog = MAX_BACKLOG,
    /// worker_count = default_workers(), options = Options::NONE }`, bound (on
    /// a later `bind()` call) to `127.0.0.1:0`.
    pub fn new() -> Self {
        Self::with_address(Address::default())
    }

    /// Same as [`Listener::new`], but remembers `address` as the default
    /// target for a later argument-less `bind()`.
    pub fn with_address(address: Address) -> Self {
        Listener {
            inner: Arc::new(ListenerInner {
                address: Mutex::new(address),
                backlog: AtomicU32::new(MAX_BACKLOG),
                options: Mutex::new(Options::NONE),
                worker_count: AtomicUsize::new(default_workers()),
                handler_setup: Mutex::new(None),
                handler_ops: Mutex::new(None),
                reactor: Mutex::new(Reactor::new()),
                notifier: ShutdownNotifier::new(SHUTDOWN_TAG),
                last_load: Mutex::new(Load::empty()),
                listen_fd: AtomicI32::new(-1),
                bound: AtomicBool::new(false),
                accept_thread: Mutex::new(None),
            }),
        }
    }

    /// Overwrites `worker_count`/`options`/`backlog`. Must be called before
    /// `bind`.
    pub fn init(&self, worker_count: usize, options: Options, backlog: u32) -> Result<(), ConfigError> {
        if self.is_bound() {
            return Err(ConfigError::InitAfterBind);
        }
        self.inner.worker_count.store(worker_count.max(1), Ordering::SeqCst);
        *self.inner.options.lock().unwrap() = options;
        self.inner.backlog.store(backlog, Ordering::SeqCst);
        Ok(())
    }

    /// Registers the upstream handler factory. `bind` without a prior call to
    /// this fails with [`ConfigError::NoHandler`].
    pub fn set_handler<F>(&self, name: &'static str, factory: F)
    where
        F: HandlerFactory,
    {
        let name_owned = name;
        let setup: Box<HandlerSetup> = Box::new(move |reactor: &mut Reactor| {
            let key = reactor.add_handler(name_owned, factory);
            Box::new(TypedHandlerOps { key }) as Box<dyn HandlerOps>
        });
        *self.inner.handler_setup.lock().unwrap() = Some(setup);
    }

    /// Binds to the address supplied at construction time.
    pub fn bind(&self) -> Result<(), ServerError> {
        let address = *self.inner.address.lock().unwrap();
        self.bind_to(address)
    }

    /// Resolves `addr` and binds, following the candidate-iteration protocol:
    /// a failed `socket`/`bind` tries the next candidate; a failed `listen`
    /// aborts immediately.
    pub fn bind_addr<A: ToSocketAddrs>(&self, addr: A) -> Result<(), ServerError> {
        let candidates = address::resolve(addr)
            .map_err(|e| ServerError::Server(e))?;
        self.bind_candidates(&candidates)
    }

    fn bind_to(&self, address: Address) -> Result<(), ServerError> {
        self.bind_candidates(&[address])
    }

    fn bind_candidates(&self, candidates: &[Address]) -> Result<(), ServerError> {
        if self.is_bound() {
            return Err(ServerError::Server(io::Error::new(
                io::ErrorKind::AlreadyExists,
                ConfigError::AlreadyBound,
            )));
        }

        let setup = self
            .inner
            .handler_setup
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ServerError::Server(io::Error::new(io::ErrorKind::Other, ConfigError::NoHandler)))?;

        let options = *self.inner.options.lock().unwrap();
        let backlog = self.inner.backlog.load(Ordering::SeqCst);

        let mio_listener = socket::bind_first_candidate(candidates, backlog, options)
            .map_err(|e| ServerError::Server(io::Error::new(io::ErrorKind::Other, e)))?;

        let fd = mio_listener.as_raw_fd();
        socket::set_nonblocking(fd).map_err(ServerError::Server)?;

        let bound_addr = mio_listener
            .local_addr()
            .map_err(ServerError::Server)?;
        *self.inner.address.lock().unwrap() = Address::from(bound_addr);

        if options.contains(Options::INSTALL_SIGNAL_HANDLER) {
            signal::install_sigint_handler().map_err(ServerError::Server)?;
        }
        signal::set_sentinel(fd);

        let worker_count = self.inner.worker_count.load(Ordering::SeqCst);
        let mut reactor = self.inner.reactor.lock().unwrap();
        reactor.init(worker_count);
        let ops = setup(&mut reactor);
        drop(reactor);
        *self.inner.handler_ops.lock().unwrap() = Some(ops);

        // `mio_listener` leaks its `TcpListener` wrapper here deliberately —
        // the raw fd (`fd`) is now owned by this Listener via `listen_fd`,
        // and the accept loop talks to it through raw `accept()` calls
        // (§4.E), not through `mio`'s own accept.
        std::mem::forget(mio_listener);

        self.inner.listen_fd.store(fd, Ordering::SeqCst);
        self.inner.bound.store(true, Ordering::SeqCst);
        info!("listener bound on {}", self.address());
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::SeqCst)
    }

    /// `0` if unbound, else the kernel-assigned port.
    pub fn get_port(&self) -> u16 {
        if !self.is_bound() {
            return 0;
        }
        self.inner.address.lock().unwrap().port()
    }

    pub fn address(&self) -> Address {
        *self.inner.address.lock().unwrap()
    }

    pub fn options(&self) -> Options {
        *self.inner.options.lock().unwrap()
    }

    /// Runs the accept loop on the calling thread until `shutdown()` or a
    /// signal-driven close unblocks it. `ready` is fulfilled once the reactor
    /// has started and the poller is set up, mirroring §4.E step 3.
    pub fn run(&self, ready: oneshot::Sender<()>) -> Result<(), ServerError> {
        if !self.is_bound() {
            return Err(ServerError::Server(io::Error::new(
                io::ErrorKind::NotConnected,
                "run() called before a successful bind()",
            )));
        }

        let listen_fd = self.inner.listen_fd.load(Ordering::SeqCst);
        let mut poller = Poller::new(128).map_err(ServerError::Server)?;

        self.inner
            .notifier
            .bind(&poller)
            .map_err(ServerError::Server)?;
        poller
            .add(listen_fd, Interest::Read, listen_fd as u64)
            .map_err(ServerError::Server)?;

        self.inner.reactor.lock().unwrap().run();
        let _ = ready.send(());

        loop {
            let events = match poller.poll(None) {
                Ok(events) => events,
                Err(e) => {
                    if e.kind() == io::ErrorKind::Interrupted {
                        if signal::sentinel_cleared() {
                            info!("accept loop interrupted by signal handler, shutting down");
                            self.finish_shutdown();
                            return Ok(());
                        }
                        warn!("poll interrupted: {}", e);
                        return Err(ServerError::Interrupted(e));
                    }
                    error!("poll failed: {}", e);
                    return Err(ServerError::Server(e));
                }
            };

            for event in events {
                if event.tag == SHUTDOWN_TAG {
                    info!("accept loop received shutdown notification");
                    self.finish_shutdown();
                    return Ok(());
                }
                if event.tag == listen_fd as u64 && event.readable {
                    match self.handle_new_connection(listen_fd) {
                        Ok(()) => {}
                        Err(ServerError::Socket(e)) => {
                            warn!("socket error accepting connection: {}", e);
                        }
                        Err(fatal) => {
                            error!("fatal server error in accept loop: {}", fatal);
                            return Err(fatal);
                        }
                    }
                }
            }
        }
    }

    /// Spawns a dedicated thread running [`Listener::run`] and stores its
    /// join handle for the destructor (via `shutdown`) to collect.
    pub fn run_threaded(&self, ready: oneshot::Sender<()>) {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("reactor-accept".to_string())
            .spawn(move || this.run(ready))
            .expect("failed to spawn accept thread");
        *self.inner.accept_thread.lock().unwrap() = Some(handle);
    }

    fn handle_new_connection(&self, listen_fd: RawFd) -> Result<(), ServerError> {
        let (fd, addr) = match socket::accept_raw(listen_fd) {
            Ok(pair) => pair,
            Err(AcceptError::ListenSocketGone(e)) => return Err(ServerError::Server(e)),
            Err(AcceptError::Transient(e)) => return Err(ServerError::Socket(e)),
        };

        if let Err(e) = socket::set_nonblocking(fd) {
            unsafe {
                libc::close(fd);
            }
            return Err(ServerError::Socket(e));
        }

        let peer = Peer::new(Address::from(addr), fd);
        trace!("accepted peer {}", peer.address());
        self.dispatch_peer(peer)
    }

    fn dispatch_peer(&self, peer: Peer) -> Result<(), ServerError> {
        let ops = self.inner.handler_ops.lock().unwrap();
        let ops = ops.as_ref().ok_or_else(|| {
            ServerError::Server(io::Error::new(io::ErrorKind::Other, "no handler registered"))
        })?;
        let reactor = self.inner.reactor.lock().unwrap();
        ops.dispatch(&reactor, peer)
    }

    /// Fires the shutdown notifier and stops the reactor. Idempotent; safe to
    /// call from any thread.
    pub fn shutdown(&self) {
        self.inner.notify_and_join();
    }

    /// Runs inside the accept loop once it is ready to return cleanly,
    /// whether woken by the shutdown notifier or by a signal-driven close.
    /// Closes the listen descriptor through the same shared sentinel the
    /// `SIGINT` handler uses ([`signal::take_and_close`]), so whichever of
    /// the two paths gets there first is the one that actually closes it.
    fn finish_shutdown(&self) {
        self.inner.reactor.lock().unwrap().shutdown();
        signal::take_and_close();
        self.inner.bound.store(false, Ordering::SeqCst);
    }

    /// Samples every worker's CPU usage and computes utilization percentages
    /// relative to `previous`.
    pub async fn request_load(&self, previous: &Load) -> Result<Load, ServerError> {
        let reactor_snapshot = {
            let ops_guard = self.inner.handler_ops.lock().unwrap();
            let ops = ops_guard.as_ref().ok_or_else(|| {
                ServerError::Server(io::Error::new(io::ErrorKind::Other, "no handler registered"))
            })?;
            // `TypedHandlerOps::request_usages` only needs `&Reactor` to call
            // `reactor.handlers(key)`, which clones cheap proxy handles, so
            // holding the reactor lock only for that snapshot is enough — the
            // returned future owns its proxies and does not borrow either
            // guard past this block.
            let reactor = self.inner.reactor.lock().unwrap();
            ops.request_usages(&reactor)
        };
        let usages = reactor_snapshot
            .await
            .map_err(ServerError::LoadSampling)?;

        let now = std::time::Instant::now();
        let load = load::compute_load(previous, usages, now);
        *self.inner.last_load.lock().unwrap() = load.clone();
        Ok(load)
    }

    /// The most recently computed [`Load`] snapshot, or an empty one if
    /// `request_load` has never been called.
    pub fn last_load(&self) -> Load {
        self.inner.last_load.lock().unwrap().clone()
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new()
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        // Mirrors `Listener::shutdown()`: wake the accept loop and join its
        // thread before tearing down the reactor and closing the listen
        // descriptor, so a `Listener` dropped without an explicit `shutdown()`
        // call doesn't leave the accept thread blocked in `poll(None)`
        // forever or leak the listen descriptor.
        self.notify_and_join();
        self.reactor.lock().unwrap().shutdown();
        signal::take_and_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer as PeerType;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc as StdArc;

    struct EchoTransport {
        count: StdArc<StdAtomicUsize>,
    }

    impl Transport for EchoTransport {
        fn handle_new_peer(&mut self, peer: PeerType) {
            self.count.fetch_add(1, Ordering::SeqCst);
            drop(peer);
        }
    }

    #[tokio::test]
    async fn bind_port_zero_then_query_then_connect() {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = Listener::new();
        listener
            .init(2, Options::REUSE_ADDR, 128)
            .unwrap();
        let count = StdArc::new(StdAtomicUsize::new(0));
        let count_for_factory = count.clone();
        listener.set_handler("echo", move || EchoTransport {
            count: count_for_factory.clone(),
        });
        listener.bind_addr("127.0.0.1:0").unwrap();
        assert!(listener.is_bound());
        assert_ne!(listener.get_port(), 0);

        let (ready_tx, ready_rx) = oneshot::channel();
        listener.run_threaded(ready_tx);
        ready_rx.await.unwrap();

        let port = listener.get_port();
        let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        drop(stream);

        std::thread::sleep(Duration::from_millis(100));
        listener.shutdown();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn bind_without_reuseaddr_fails_on_a_port_already_in_use() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();

        let listener = Listener::new();
        listener.set_handler("echo", || EchoTransport {
            count: StdArc::new(StdAtomicUsize::new(0)),
        });
        let result = listener.bind_addr(("127.0.0.1", port));
        assert!(result.is_err());
        assert!(!listener.is_bound());
    }

    #[tokio::test]
    async fn request_load_first_sample_is_zero() {
        let listener = Listener::new();
        listener.init(2, Options::REUSE_ADDR, 128).unwrap();
        listener.set_handler("echo", || EchoTransport {
            count: StdArc::new(StdAtomicUsize::new(0)),
        });
        listener.bind_addr("127.0.0.1:0").unwrap();

        // `request_load` round-trips through each worker's own task, so the
        // reactor must actually be running (not just initialized) before a
        // reply can arrive.
        let (ready_tx, ready_rx) = oneshot::channel();
        listener.run_threaded(ready_tx);
        ready_rx.await.unwrap();

        let previous = Load::empty();
        let load = listener.request_load(&previous).await.unwrap();
        assert_eq!(load.global, 0.0);
        assert_eq!(load.workers, vec![0.0, 0.0]);

        listener.shutdown();
    }
}
