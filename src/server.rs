//! Daemon lifecycle
//!
//! `Daemon::bind` acquires every startup resource, `Daemon::serve` runs the
//! control, plaintext and TLS listeners until the shutdown future resolves.

use crate::certificate::CertResolver;
use crate::config::Config;
use crate::control::{ControlApi, ControlSocket};
use crate::deadline::{DeadlineIo, InFlight};
use crate::error::{Error, Result};
use crate::proxy::{ProxyRouter, Scheme};
use crate::store::RouteStore;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Stall limits applied to every accepted client connection
#[derive(Debug, Clone, Copy)]
struct ClientTimeouts {
    read: Duration,
    write: Duration,
}

/// A daemon holding all of its resources, ready to serve
pub struct Daemon {
    config: Config,
    store: Arc<RouteStore>,
    control: ControlSocket,
    http_listener: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
}

impl Daemon {
    /// Acquire directories, store, control socket and listeners
    pub async fn bind(config: Config) -> Result<Self> {
        let resolver = CertResolver::new(&config.certs_dir).map_err(|e| {
            Error::Startup(format!(
                "failed to create certs dir {}: {}",
                config.certs_dir.display(),
                e
            ))
        })?;

        let store = RouteStore::open(&config.db_path).map_err(|e| {
            Error::Startup(format!("failed to open db {}: {}", config.db_path.display(), e))
        })?;
        info!("Route store opened at {}", config.db_path.display());

        let control = ControlSocket::prepare(&config.socket_path).await?;

        let http_listener = bind_tcp(config.http_addr).await?;
        info!("Proxy listening on {}", http_listener.local_addr()?);

        let tls = match config.tls_addr {
            Some(addr) => {
                let listener = bind_tcp(addr).await?;
                info!(
                    "Secure proxy listening on {} (certificates from {})",
                    listener.local_addr()?,
                    resolver.certs_dir().display()
                );
                Some((listener, Arc::new(resolver).acceptor()))
            }
            None => None,
        };

        Ok(Self {
            config,
            store: Arc::new(store),
            control,
            http_listener,
            tls,
        })
    }

    /// Bound plaintext address
    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http_listener.local_addr()
    }

    /// Bound TLS address, if TLS is enabled
    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    /// Control socket path
    pub fn socket_path(&self) -> &Path {
        self.control.path()
    }

    /// Shared route store
    pub fn store(&self) -> Arc<RouteStore> {
        self.store.clone()
    }

    /// Serve until `shutdown` resolves, then drain connections and release
    /// the control socket
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Daemon {
            config,
            store,
            control,
            http_listener,
            tls,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = Arc::new(ProxyRouter::new(store.clone(), config.upstream_timeout));
        let control = Arc::new(control);
        let client_timeouts = ClientTimeouts {
            read: config.read_timeout,
            write: config.write_timeout,
        };
        let control_timeouts = ClientTimeouts {
            read: config.control_timeout,
            write: config.control_timeout,
        };

        let mut listeners = JoinSet::new();
        listeners.spawn(serve_control(
            control.clone(),
            ControlApi::new(store),
            control_timeouts,
            config.shutdown_grace,
            shutdown_rx.clone(),
        ));
        listeners.spawn(serve_proxy(
            http_listener,
            None,
            router.clone(),
            client_timeouts,
            config.shutdown_grace,
            shutdown_rx.clone(),
        ));
        if let Some((listener, acceptor)) = tls {
            listeners.spawn(serve_proxy(
                listener,
                Some(acceptor),
                router,
                client_timeouts,
                config.shutdown_grace,
                shutdown_rx,
            ));
        }

        shutdown.await;
        info!("Shutting down...");
        let _ = shutdown_tx.send(true);

        while let Some(result) = listeners.join_next().await {
            if let Err(e) = result {
                warn!("Listener task failed: {}", e);
            }
        }

        // Last reference: dropping it unlinks the socket file
        drop(control);
        info!("Shutdown complete");

        Ok(())
    }
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Startup(format!("failed to listen on {}: {}", addr, e)))
}

async fn serve_control(
    control: Arc<ControlSocket>,
    api: ControlApi,
    timeouts: ClientTimeouts,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = control.accept() => match accepted {
                Ok(stream) => {
                    connections.spawn(control_connection(
                        stream,
                        api.clone(),
                        timeouts,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Control accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drain(connections, grace, "control").await;
}

async fn control_connection(
    stream: UnixStream,
    api: ControlApi,
    timeouts: ClientTimeouts,
    mut shutdown: watch::Receiver<bool>,
) {
    let io = DeadlineIo::new(stream, timeouts.read, timeouts.write, InFlight::new());

    let service = service_fn(move |req| {
        let api = api.clone();
        async move { api.handle(req).await }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Control connection error: {}", e);
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!("Control connection error: {}", e);
            }
        }
    }
}

async fn serve_proxy(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    router: Arc<ProxyRouter>,
    timeouts: ClientTimeouts,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let scheme = if tls.is_some() { Scheme::Https } else { Scheme::Http };

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read);
    // No keep-alive pings: they would keep idle sessions alive past the
    // read deadline
    builder.http2().timer(TokioTimer::new());

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    connections.spawn(proxy_connection(
                        stream,
                        remote_addr,
                        tls.clone(),
                        builder.clone(),
                        router.clone(),
                        timeouts,
                        scheme,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Accept failed on {} listener: {}", scheme.as_str(), e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drain(connections, grace, scheme.as_str()).await;
}

#[allow(clippy::too_many_arguments)]
async fn proxy_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    builder: auto::Builder<TokioExecutor>,
    router: Arc<ProxyRouter>,
    timeouts: ClientTimeouts,
    scheme: Scheme,
    shutdown: watch::Receiver<bool>,
) {
    let in_flight = InFlight::new();
    let io = DeadlineIo::new(stream, timeouts.read, timeouts.write, in_flight.clone());

    let Some(acceptor) = tls else {
        serve_io(io, remote_addr, in_flight, builder, router, scheme, shutdown).await;
        return;
    };

    // The handshake runs here, not in the accept loop, so a stalled client
    // or a missing certificate only costs this connection
    match tokio::time::timeout(timeouts.read, acceptor.accept(io)).await {
        Ok(Ok(tls_stream)) => {
            serve_io(tls_stream, remote_addr, in_flight, builder, router, scheme, shutdown).await
        }
        Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", remote_addr, e),
        Err(_) => debug!("TLS handshake with {} timed out", remote_addr),
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_io<I>(
    io: I,
    remote_addr: SocketAddr,
    in_flight: InFlight,
    builder: auto::Builder<TokioExecutor>,
    router: Arc<ProxyRouter>,
    scheme: Scheme,
    mut shutdown: watch::Receiver<bool>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let router = router.clone();
        let guard = in_flight.enter();
        async move {
            let response = router.handle(req, remote_addr, scheme).await?;
            Ok::<_, Infallible>(guard.hold_for(response))
        }
    });
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("HTTP connection error from {}: {}", remote_addr, e);
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!("HTTP connection error from {}: {}", remote_addr, e);
            }
        }
    }
}

/// Wait for open connections up to `grace`, then abort the rest
async fn drain(mut connections: JoinSet<()>, grace: Duration, listener: &str) {
    if connections.is_empty() {
        return;
    }

    info!(
        "Waiting up to {:?} for {} {} connection(s)",
        grace,
        connections.len(),
        listener
    );

    let finished = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            "Closing {} {} connection(s) still open after grace period",
            connections.len(),
            listener
        );
        connections.shutdown().await;
    }
}
