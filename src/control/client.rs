//! Client side of the control socket, used by `proxyctl`

use super::api::{AddRequest, RemoveRequest, RouteEntry};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::debug;

/// HTTP/1.1 client bound to a control socket path
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new<P: Into<PathBuf>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Liveness check
    pub async fn health(&self) -> Result<()> {
        self.send(Method::GET, "/api/health", None).await?;
        Ok(())
    }

    /// All routes, ordered by domain
    pub async fn list(&self) -> Result<Vec<RouteEntry>> {
        let body = self.send(Method::GET, "/api/list", None).await?;
        serde_json::from_slice(&body).context("Failed to parse route list")
    }

    /// Insert or replace a route
    pub async fn add(&self, domain: &str, target: &str) -> Result<()> {
        let body = serde_json::to_vec(&AddRequest {
            domain: domain.to_string(),
            target: target.to_string(),
        })?;
        self.send(Method::POST, "/api/add", Some(body)).await?;
        Ok(())
    }

    /// Delete a route. Succeeds whether or not it existed.
    pub async fn remove(&self, domain: &str) -> Result<()> {
        let body = serde_json::to_vec(&RemoveRequest {
            domain: domain.to_string(),
        })?;
        self.send(Method::POST, "/api/remove", Some(body)).await?;
        Ok(())
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let stream = UnixStream::connect(&self.socket_path).await.with_context(|| {
            format!(
                "Failed to connect to control socket at {}",
                self.socket_path.display()
            )
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("Failed to establish control connection")?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Control connection error: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "localhost");
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .context("Failed to build control request")?;

        let response = sender
            .send_request(request)
            .await
            .context("Control request failed")?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .context("Failed to read control response")?
            .to_bytes();

        if status != StatusCode::OK {
            bail!(
                "control request failed ({}): {}",
                status,
                String::from_utf8_lossy(&bytes).trim()
            );
        }

        Ok(bytes)
    }
}
