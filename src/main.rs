//! proxyd - main entry point

use anyhow::Result;
use clap::Parser;
use proxyd::config::{DEFAULT_HTTP_PORT, DEFAULT_TLS_PORT};
use proxyd::{Config, Daemon};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// proxyd - a Host-routed reverse proxy daemon
#[derive(Parser, Debug)]
#[command(name = "proxyd")]
#[command(version = "1.0.0")]
#[command(about = "Host-routed reverse proxy with a Unix-socket control API")]
struct Args {
    /// Storage directory holding config.db, proxyd.sock and certs/
    #[arg(long, env = "PROXYD_STORAGE", default_value = "./storage")]
    storage: PathBuf,

    /// Database path (defaults to <storage>/config.db)
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,

    /// Control socket path (defaults to <storage>/proxyd.sock)
    #[arg(long, env = "PROXYD_SOCKET")]
    socket: Option<PathBuf>,

    /// Certificates directory (defaults to <storage>/certs)
    #[arg(long, env = "CERTS_DIR")]
    certs_dir: Option<PathBuf>,

    /// Address to bind the proxy listeners on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    port: u16,

    /// Enable the TLS listener
    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    tls: bool,

    /// TLS port to listen on
    #[arg(long, env = "TLS_PORT", default_value_t = DEFAULT_TLS_PORT)]
    tls_port: u16,

    /// Seconds an idle or silent client connection is kept open
    #[arg(long, default_value = "30")]
    read_timeout: u64,

    /// Seconds a write to a client may stall before the connection is dropped
    #[arg(long, default_value = "30")]
    write_timeout: u64,

    /// Seconds to wait for a backend to connect and send response headers
    #[arg(long, default_value = "30")]
    upstream_timeout: u64,

    /// Seconds to let in-flight requests finish on shutdown
    #[arg(long, default_value = "10")]
    shutdown_grace: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::from_storage_dir(&self.storage);
        if let Some(ref db_path) = self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(ref socket) = self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(ref certs_dir) = self.certs_dir {
            config.certs_dir = certs_dir.clone();
        }
        config.http_addr = SocketAddr::new(self.bind, self.port);
        config.tls_addr = self.tls.then(|| SocketAddr::new(self.bind, self.tls_port));
        config.read_timeout = Duration::from_secs(self.read_timeout);
        config.write_timeout = Duration::from_secs(self.write_timeout);
        config.upstream_timeout = Duration::from_secs(self.upstream_timeout);
        config.shutdown_grace = Duration::from_secs(self.shutdown_grace);
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Starting proxyd v1.0.0");

    let daemon = match Daemon::bind(args.config()).await {
        Ok(daemon) => daemon,
        Err(e) if e.is_startup() => {
            error!("{}", e);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    info!("proxyd started successfully");

    daemon.serve(shutdown_signal()).await?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
