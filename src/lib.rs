//! Connection acceptance and worker dispatch core for an HTTP server
//! framework.
//!
//! Binds a TCP listening socket, runs a non-blocking accept loop driven by
//! readiness notification, and fans accepted connections out across a fixed
//! pool of worker [`Reactor`] threads. Protocol parsing, routing, and TLS are
//! out of scope — they live above this crate, talking to it only through the
//! [`Transport`] trait.
//!
//! ```no_run
//! use reactor_core::{Listener, Options};
//!
//! # struct EchoTransport;
//! # impl reactor_core::Transport for EchoTransport {
//! #     fn handle_new_peer(&mut self, _peer: reactor_core::Peer) {}
//! # }
//! let listener = Listener::new();
//! listener.init(4, Options::REUSE_ADDR, 1024).unwrap();
//! listener.set_handler("echo", || EchoTransport);
//! listener.bind_addr("127.0.0.1:8080").unwrap();
//! let (ready_tx, _ready_rx) = tokio::sync::oneshot::channel();
//! listener.run_threaded(ready_tx);
//! listener.shutdown();
//! ```

mod address;
mod error;
mod listener;
mod load;
mod options;
mod peer;
mod poller;
mod reactor;
mod shutdown;
mod signal;
mod socket;
mod transport;

pub use address::{Address, Family};
pub use error::{ConfigError, ServerError};
pub use listener::{default_workers, Listener, MAX_BACKLOG};
pub use load::Load;
pub use options::Options;
pub use peer::Peer;
pub use reactor::{HandlerKey, Reactor, WorkerProxy};
pub use transport::{pin_worker, HandlerFactory, ResourceUsage, Transport};
