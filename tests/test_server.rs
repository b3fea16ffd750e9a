use std::net;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_core::{Listener, Options, Peer, Transport};

struct CountingTransport {
    count: Arc<AtomicUsize>,
}

impl Transport for CountingTransport {
    fn handle_new_peer(&mut self, peer: Peer) {
        self.count.fetch_add(1, Ordering::SeqCst);
        drop(peer);
    }
}

fn start(options: Options, workers: usize) -> (Listener, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let listener = Listener::new();
    listener.init(workers, options, 128).unwrap();
    let count_for_factory = count.clone();
    listener.set_handler("echo", move || CountingTransport {
        count: count_for_factory.clone(),
    });
    listener.bind_addr("127.0.0.1:0").unwrap();

    let (ready_tx, _ready_rx) = tokio::sync::oneshot::channel();
    listener.run_threaded(ready_tx);
    thread::sleep(Duration::from_millis(200));

    (listener, count)
}

#[test]
fn bind_port_zero_then_query_then_connect() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (listener, count) = start(Options::REUSE_ADDR, 2);
    assert!(listener.is_bound());
    let port = listener.get_port();
    assert_ne!(port, 0);

    let stream = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(200));
    drop(stream);

    listener.shutdown();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn fan_out_reaches_every_worker_over_many_connections() {
    let (listener, count) = start(Options::REUSE_ADDR, 4);
    let port = listener.get_port();

    for _ in 0..16 {
        let stream = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        drop(stream);
    }
    thread::sleep(Duration::from_millis(300));

    listener.shutdown();
    assert_eq!(count.load(Ordering::SeqCst), 16);
}

#[test]
fn poll_driven_shutdown_unblocks_run_promptly() {
    let (listener, _count) = start(Options::REUSE_ADDR, 1);
    assert!(listener.is_bound());

    let before = std::time::Instant::now();
    listener.shutdown();
    assert!(before.elapsed() < Duration::from_millis(500));
    assert!(!listener.is_bound());
}

#[test]
fn bind_without_reuseaddr_fails_on_an_in_use_port() {
    let occupied = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let listener = Listener::new();
    listener.set_handler("echo", || CountingTransport {
        count: Arc::new(AtomicUsize::new(0)),
    });
    let result = listener.bind_addr(("127.0.0.1", port));

    assert!(result.is_err());
    assert!(!listener.is_bound());
}

#[test]
fn load_progresses_from_zero_once_a_worker_does_cpu_work() {
    let listener = Listener::new();
    listener.init(2, Options::REUSE_ADDR, 128).unwrap();
    listener.set_handler("echo", || CountingTransport {
        count: Arc::new(AtomicUsize::new(0)),
    });
    listener.bind_addr("127.0.0.1:0").unwrap();

    let (ready_tx, _ready_rx) = tokio::sync::oneshot::channel();
    listener.run_threaded(ready_tx);
    thread::sleep(Duration::from_millis(200));

    actix_rt::System::new().block_on(async {
        let first = listener
            .request_load(&reactor_core::Load::empty())
            .await
            .unwrap();
        assert_eq!(first.global, 0.0);

        let mut x: u64 = 0;
        for i in 0..50_000_000u64 {
            x = x.wrapping_add(i);
        }
        std::hint::black_box(x);

        let second = listener.request_load(&first).await.unwrap();
        assert!(second.global >= 0.0);
        assert_eq!(second.workers.len(), 2);
    });

    listener.shutdown();
}
