//! Daemon configuration
//!
//! Everything lives under one storage directory by default: the route
//! database, the control socket and the certificate directory.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default plaintext proxy port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default TLS proxy port
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding the routes table
    pub db_path: PathBuf,
    /// Control channel (Unix domain socket)
    pub socket_path: PathBuf,
    /// Directory of `<domain>.crt` / `<domain>.key` pairs
    pub certs_dir: PathBuf,
    /// Plaintext proxy listener
    pub http_addr: SocketAddr,
    /// TLS proxy listener, disabled when `None`
    pub tls_addr: Option<SocketAddr>,
    /// Longest client silence while no request is outstanding; also bounds
    /// request headers and TLS handshakes
    pub read_timeout: Duration,
    /// Longest a write to a client may stall
    pub write_timeout: Duration,
    /// Backend connect and response-head timeout
    pub upstream_timeout: Duration,
    /// Header read timeout on the control channel
    pub control_timeout: Duration,
    /// How long in-flight connections may run after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Config {
    /// Derive all paths from a single storage directory
    pub fn from_storage_dir<P: AsRef<Path>>(storage_dir: P) -> Self {
        let dir = storage_dir.as_ref();
        Self {
            db_path: dir.join("config.db"),
            socket_path: dir.join("proxyd.sock"),
            certs_dir: dir.join("certs"),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_HTTP_PORT)),
            tls_addr: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_storage_dir("./storage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_storage_dir() {
        let config = Config::from_storage_dir("/var/lib/proxyd");
        assert_eq!(config.db_path, PathBuf::from("/var/lib/proxyd/config.db"));
        assert_eq!(config.socket_path, PathBuf::from("/var/lib/proxyd/proxyd.sock"));
        assert_eq!(config.certs_dir, PathBuf::from("/var/lib/proxyd/certs"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_addr.port(), DEFAULT_HTTP_PORT);
        assert!(config.tls_addr.is_none());
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(30));
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
        assert_eq!(config.control_timeout, Duration::from_secs(5));
    }
}
