//! Error types for proxyd

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for proxyd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the route store, control plane, resolver and router
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing control input
    #[error("{0}")]
    Validation(String),

    /// Route or resource absent
    #[error("no route for {0}")]
    NotFound(String),

    /// Persistence-layer failure
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A stored target that cannot be turned into a backend URL
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// Backend unreachable, timed out or misbehaving
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Certificate missing or unusable for the requested server name
    #[error("handshake error: {0}")]
    Handshake(String),

    /// A live daemon already serves the control socket
    #[error("another proxyd instance is running ({})", .0.display())]
    AlreadyRunning(PathBuf),

    /// Resource acquisition failure before serving traffic
    #[error("startup error: {0}")]
    Startup(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error aborts daemon startup
    pub fn is_startup(&self) -> bool {
        matches!(self, Error::AlreadyRunning(_) | Error::Startup(_))
    }
}
