//! Fixed-size worker pool with a pluggable handler-kind registry.
//!
//! Generalizes the teacher's `ServerWorker`/`WorkerHandle` split
//! (`worker.rs`): each worker is a dedicated OS thread running its own
//! single-threaded async executor, and callers talk to a worker's live
//! handler only through a cheap, `Send + Sync` proxy — never the handler
//! itself, which stays worker-local.

use std::any::Any;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, info, trace};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::peer::Peer;
use crate::transport::{HandlerFactory, ResourceUsage, Transport};

type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
type LoadReply = oneshot::Sender<io::Result<ResourceUsage>>;

/// Opaque token returned by [`Reactor::add_handler`]; used to look up the
/// worker-cloned instances of that handler kind via [`Reactor::handlers`].
pub struct HandlerKey<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for HandlerKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for HandlerKey<T> {}

/// The cross-thread-safe handle to one worker's live [`Transport`] instance
/// for a given handler kind. This is what `reactor.handlers(key)` returns —
/// it implements the same two operations the specification's Transport
/// interface names, forwarding each over a channel into the worker thread
/// that actually owns the transport.
pub struct WorkerProxy<T> {
    idx: usize,
    peer_tx: mpsc::UnboundedSender<Peer>,
    load_tx: mpsc::UnboundedSender<LoadReply>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for WorkerProxy<T> {
    fn clone(&self) -> Self {
        WorkerProxy {
            idx: self.idx,
            peer_tx: self.peer_tx.clone(),
            load_tx: self.load_tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Transport> WorkerProxy<T> {
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Hands `peer` to this worker. Non-blocking: it only enqueues the peer
    /// on an unbounded channel, matching §5's "must be non-blocking from the
    /// accept thread's perspective".
    pub fn handle_new_peer(&self, peer: Peer) {
        // An unbound, dead channel (worker already shut down) means the peer
        // is simply dropped, closing its fd via `Peer`'s `Drop`.
        let _ = self.peer_tx.send(peer);
    }

    /// Requests this worker's cumulative CPU usage.
    pub fn load(&self) -> impl Future<Output = io::Result<ResourceUsage>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let sent = self.load_tx.send(tx).is_ok();
        async move {
            if !sent {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "worker is not running",
                ));
            }
            rx.await.map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "worker dropped load reply")
            })?
        }
    }
}

struct WorkerChannels {
    peer_rx: Mutex<Option<mpsc::UnboundedReceiver<Peer>>>,
    load_rx: Mutex<Option<mpsc::UnboundedReceiver<LoadReply>>>,
}

type KindRunner = dyn Fn(Arc<WorkerChannels>) -> LocalBoxFuture<'static, ()> + Send + Sync;

struct KindEntry {
    name: &'static str,
    proxies: Box<dyn Any + Send + Sync>,
    worker_channels: Vec<Arc<WorkerChannels>>,
    runner: Arc<KindRunner>,
}

struct WorkerRuntime {
    stop: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

/// A fixed-size worker pool; hosts one or more handler *kinds*, each cloned
/// per worker.
pub struct Reactor {
    worker_count: usize,
    kinds: Vec<KindEntry>,
    workers: Vec<WorkerRuntime>,
    running: bool,
}

impl Reactor {
    pub fn new() -> Self {
        Reactor {
            worker_count: 0,
            kinds: Vec::new(),
            workers: Vec::new(),
            running: false,
        }
    }

    /// Allocates `worker_count` worker contexts. Must be called before
    /// `run` (and is idempotent with respect to already-registered handler
    /// kinds only if called before `add_handler`).
    pub fn init(&mut self, worker_count: usize) {
        assert_ne!(worker_count, 0, "worker_count must be greater than 0");
        self.worker_count = worker_count;
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Registers a handler kind, producing exactly `worker_count` proxy
    /// instances (the live transports are built lazily, on their worker
    /// thread, when `run` starts). Callable before `run` only.
    pub fn add_handler<F>(&mut self, name: &'static str, factory: F) -> HandlerKey<F::Transport>
    where
        F: HandlerFactory,
    {
        assert!(!self.running, "add_handler called after run");
        assert_ne!(self.worker_count, 0, "init() must be called before add_handler()");

        let n = self.worker_count;
        let factory = Arc::new(factory);

        let mut proxies: Vec<WorkerProxy<F::Transport>> = Vec::with_capacity(n);
        let mut channels = Vec::with_capacity(n);

        for idx in 0..n {
            let (peer_tx, peer_rx) = mpsc::unbounded_channel();
            let (load_tx, load_rx) = mpsc::unbounded_channel();
            proxies.push(WorkerProxy {
                idx,
                peer_tx,
                load_tx,
                _marker: PhantomData,
            });
            channels.push(Arc::new(WorkerChannels {
                peer_rx: Mutex::new(Some(peer_rx)),
                load_rx: Mutex::new(Some(load_rx)),
            }));
        }

        let runner_factory = factory.clone();
        let runner: Arc<KindRunner> = Arc::new(move |ch: Arc<WorkerChannels>| {
            let factory = runner_factory.clone();
            Box::pin(async move {
                let mut transport = factory.build();
                let mut peer_rx = ch
                    .peer_rx
                    .lock()
                    .unwrap()
                    .take()
                    .expect("handler kind task spawned twice on the same worker");
                let mut load_rx = ch
                    .load_rx
                    .lock()
                    .unwrap()
                    .take()
                    .expect("handler kind task spawned twice on the same worker");

                loop {
                    tokio::select! {
                        peer = peer_rx.recv() => match peer {
                            Some(peer) => transport.handle_new_peer(peer),
                            None => break,
                        },
                        reply = load_rx.recv() => match reply {
                            Some(reply) => {
                                let _ = reply.send(transport.resource_usage());
                            }
                            None => break,
                        },
                    }
                }
            }) as LocalBoxFuture<'static, ()>
        });

        let index = self.kinds.len();
        self.kinds.push(KindEntry {
            name,
            proxies: Box::new(proxies),
            worker_channels: channels,
            runner,
        });

        HandlerKey {
            index,
            _marker: PhantomData,
        }
    }

    /// Returns the per-worker proxy instances for `key`, in the stable order
    /// `dispatch_peer`'s `fd % N` arithmetic relies on.
    pub fn handlers<T: Transport>(&self, key: HandlerKey<T>) -> Vec<WorkerProxy<T>> {
        self.kinds[key.index]
            .proxies
            .downcast_ref::<Vec<WorkerProxy<T>>>()
            .expect("handler kind type mismatch")
            .clone()
    }

    /// Starts one OS thread per worker, each running every registered
    /// handler kind's local task on its own single-threaded executor.
    pub fn run(&mut self) {
        if self.running {
            return;
        }
        self.running = true;

        for idx in 0..self.worker_count {
            let stop = Arc::new(Notify::new());
            let stop_for_thread = stop.clone();
            let runners: Vec<(Arc<KindRunner>, Arc<WorkerChannels>, &'static str)> = self
                .kinds
                .iter()
                .map(|k| (k.runner.clone(), k.worker_channels[idx].clone(), k.name))
                .collect();

            let thread = thread::Builder::new()
                .name(format!("reactor-worker-{}", idx))
                .spawn(move || {
                    let sys = actix_rt::System::new();
                    sys.block_on(async move {
                        let local = tokio::task::LocalSet::new();
                        for (runner, channels, name) in &runners {
                            trace!("worker {} starting handler kind {:?}", idx, name);
                            local.spawn_local(runner(channels.clone()));
                        }
                        tokio::select! {
                            _ = stop_for_thread.notified() => {}
                            _ = local => {}
                        }
                    });
                })
                .expect("failed to spawn reactor worker thread");

            self.workers.push(WorkerRuntime {
                stop,
                thread: Some(thread),
            });
        }

        info!("reactor started {} workers", self.worker_count);
    }

    /// Requests every worker to exit its loop and joins the threads.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.stop.notify_one();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    error!("reactor worker thread panicked during shutdown");
                }
            }
        }
        self.workers.clear();
        self.running = false;
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Reactor::new()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        received: Arc<AtomicUsize>,
    }

    impl Transport for CountingTransport {
        fn handle_new_peer(&mut self, peer: Peer) {
            self.received.fetch_add(1, Ordering::SeqCst);
            drop(peer);
        }
    }

    #[test]
    fn handlers_are_stable_ordered_across_calls() {
        let mut reactor = Reactor::new();
        reactor.init(4);
        let key = reactor.add_handler("test", || CountingTransport {
            received: Arc::new(AtomicUsize::new(0)),
        });

        let a = reactor.handlers(key);
        let b = reactor.handlers(key);
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 4);
        for i in 0..4 {
            assert_eq!(a[i].index(), i);
            assert_eq!(b[i].index(), i);
        }
    }

    #[test]
    fn fan_out_delivers_each_peer_to_the_expected_worker() {
        let counters: Vec<_> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let counters_for_factory = counters.clone();
        let next = Arc::new(AtomicUsize::new(0));

        let mut reactor = Reactor::new();
        reactor.init(4);
        let key = reactor.add_handler("test", move || {
            let i = next.fetch_add(1, Ordering::SeqCst);
            CountingTransport {
                received: counters_for_factory[i].clone(),
            }
        });
        reactor.run();

        let handlers = reactor.handlers(key);
        assert_eq!(handlers.len(), 4);

        for fd in 10..18 {
            let idx = (fd as usize) % handlers.len();
            let peer = crate::peer::test_support::fake_peer(fd);
            handlers[idx].handle_new_peer(peer);
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
        reactor.shutdown();

        let total: usize = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
        assert_eq!(total, 8);
    }
}
