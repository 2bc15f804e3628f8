//! proxyd - a Host-routed reverse proxy daemon
//!
//! Provides:
//! - Domain routing backed by a SQLite route table
//! - A Unix-socket control API for live route changes (`proxyctl`)
//! - Per-domain TLS certificates selected by SNI from a directory
//! - Streaming proxying with X-Forwarded headers and protocol upgrades

#[cfg(not(unix))]
compile_error!("proxyd requires a Unix platform (control socket and file modes)");

pub mod certificate;
pub mod config;
pub mod control;
pub mod deadline;
pub mod error;
pub mod proxy;
pub mod server;
pub mod store;

pub use certificate::CertResolver;
pub use config::Config;
pub use control::{ControlApi, ControlClient, ControlSocket};
pub use error::{Error, Result};
pub use proxy::{ProxyRouter, Scheme};
pub use server::Daemon;
pub use store::{Route, RouteStore};
