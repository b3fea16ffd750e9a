use std::io;

use thiserror::Error;

/// Errors that can escape the accept loop.
///
/// `Socket` errors describe a single failed `accept()` and are recoverable —
/// the accept loop logs them and keeps running. `Server` errors mean the
/// listening socket itself is no longer usable and terminate `run`.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A single accepted connection failed; the listen socket is still good.
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    /// The listen socket itself is invalid, or polling it failed fatally.
    #[error("server error: {0}")]
    Server(#[source] io::Error),

    /// `poll` was interrupted by something other than our own shutdown path.
    #[error("interrupted: {0}")]
    Interrupted(#[source] io::Error),

    /// One or more workers failed to report their resource usage.
    #[error("load sampling failed: {0}")]
    LoadSampling(#[source] io::Error),
}

impl ServerError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ServerError::Socket(_))
    }
}

/// Misuse of the builder API: these are programmer errors, not runtime
/// failures, and are reported eagerly rather than deferred to `run`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("set_handler() was not called before bind()")]
    NoHandler,

    #[error("bind() was called on an already-bound listener")]
    AlreadyBound,

    #[error("init() was called after bind()")]
    InitAfterBind,

    #[error("could not resolve any usable address for binding")]
    NoAddress,

    #[error(transparent)]
    Bind(#[from] io::Error),
}
