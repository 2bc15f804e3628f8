//! Host-based request routing
//! Looks up the backend for each request's Host and streams the exchange

use crate::error::{Error, Result};
use crate::store::RouteStore;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

/// Body type of every response the daemon produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type HttpClient = Client<HttpsConnector<HttpConnector>, Incoming>;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Listener a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Per-request dispatcher shared by the plaintext and TLS listeners
///
/// Holds no copy of the routing table: every request does a fresh lookup.
pub struct ProxyRouter {
    store: Arc<RouteStore>,
    client: HttpClient,
    upstream_timeout: Duration,
}

impl ProxyRouter {
    /// Create a router; `upstream_timeout` bounds backend connect and response head
    pub fn new(store: Arc<RouteStore>, upstream_timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(upstream_timeout));

        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new_with_connector(http));

        Self {
            store,
            client,
            upstream_timeout,
        }
    }

    /// Serve one inbound request
    pub async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        Ok(self.dispatch(req, remote_addr, scheme).await)
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Response<ProxyBody> {
        let original_host = match request_host(&req) {
            Some(host) => host,
            None => return text_response(StatusCode::BAD_REQUEST, "missing host"),
        };
        let domain = strip_port(&original_host);

        debug!("{} {} for {} from {}", req.method(), req.uri().path(), domain, remote_addr);

        let target = match self.resolve(domain) {
            Ok(target) => target,
            Err(Error::NotFound(_)) => return text_response(StatusCode::NOT_FOUND, "no route"),
            Err(e @ Error::InvalidTarget { .. }) => {
                warn!("Route for {} unusable: {}", domain, e);
                return text_response(StatusCode::BAD_GATEWAY, "invalid target");
            }
            Err(e) => {
                error!("Route lookup for {} failed: {}", domain, e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };

        match self.forward(req, &target, &original_host, remote_addr, scheme).await {
            Ok(response) => response,
            Err(e) => {
                error!("Proxy error for {} -> {}: {}", domain, target, e);
                text_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }

    /// Backend URL for a domain
    pub fn resolve(&self, domain: &str) -> Result<Url> {
        let target = self
            .store
            .lookup(domain)?
            .ok_or_else(|| Error::NotFound(domain.to_string()))?;
        normalize_target(&target)
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        target: &Url,
        original_host: &str,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>> {
        let upgrade = upgrade_protocol(&req);
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri(target, &parts.uri)?;
        parts.version = Version::HTTP_11;
        strip_hop_headers(&mut parts.headers);
        if let Some(protocol) = upgrade {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol);
        }
        set_forwarding_headers(&mut parts.headers, target, original_host, remote_addr, scheme)?;

        debug!("Proxying to: {}", parts.uri);

        let outbound = Request::from_parts(parts, body);
        let mut response = tokio::time::timeout(self.upstream_timeout, self.client.request(outbound))
            .await
            .map_err(|_| {
                Error::Upstream(format!("no response within {:?}", self.upstream_timeout))
            })?
            .map_err(|e| Error::Upstream(describe(&e)))?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(tunnel(client_upgrade, backend_upgrade));
                let (parts, _) = response.into_parts();
                return Ok(Response::from_parts(parts, empty_body()));
            }
        }

        strip_hop_headers(response.headers_mut());
        Ok(response.map(|body| body.boxed()))
    }
}

/// Splice an upgraded client connection onto the upgraded backend connection
async fn tunnel(client: OnUpgrade, backend: OnUpgrade) {
    match tokio::try_join!(client, backend) {
        Ok((client, backend)) => {
            let mut client = TokioIo::new(client);
            let mut backend = TokioIo::new(backend);
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((sent, received)) => {
                    debug!("Upgraded connection closed ({} bytes up, {} bytes down)", sent, received)
                }
                Err(e) => debug!("Upgraded connection error: {}", e),
            }
        }
        Err(e) => warn!("Connection upgrade failed: {}", e),
    }
}

/// Host the client asked for, as sent (port included)
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

/// Drop an optional `:port` suffix, keeping bracketed IPv6 literals intact
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.find(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Turn a stored target into an absolute backend URL, assuming `http`
pub fn normalize_target(target: &str) -> Result<Url> {
    let target = target.trim();
    let invalid = |reason: String| Error::InvalidTarget {
        target: target.to_string(),
        reason,
    };

    let absolute = if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    };

    let url = Url::parse(&absolute).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(url)
}

fn target_authority(target: &Url) -> String {
    let host = target.host_str().unwrap_or_default();
    match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Request URI rewritten onto the target: paths joined with one slash,
/// target query first
pub fn upstream_uri(target: &Url, uri: &Uri) -> Result<Uri> {
    let base = target.path().trim_end_matches('/');
    let path = uri.path();
    let joined = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };

    let query = match (target.query(), uri.query()) {
        (Some(a), Some(b)) => Some(format!("{}&{}", a, b)),
        (a, b) => a.or(b).map(str::to_string),
    };

    let mut upstream = format!("{}://{}{}", target.scheme(), target_authority(target), joined);
    if let Some(query) = query {
        upstream.push('?');
        upstream.push_str(&query);
    }

    upstream.parse::<Uri>().map_err(|e| Error::InvalidTarget {
        target: target.to_string(),
        reason: e.to_string(),
    })
}

fn upgrade_protocol<B>(req: &Request<B>) -> Option<HeaderValue> {
    if req.version() != Version::HTTP_11 {
        return None;
    }
    let wants_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    req.headers().get(UPGRADE).cloned()
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Point Host at the backend and record the client's view in X-Forwarded-*.
/// X-Forwarded-For is replaced with the peer address, never appended to.
fn set_forwarding_headers(
    headers: &mut HeaderMap,
    target: &Url,
    original_host: &str,
    remote_addr: SocketAddr,
    scheme: Scheme,
) -> Result<()> {
    let value = |v: &str| {
        HeaderValue::from_str(v).map_err(|e| Error::Upstream(format!("invalid header value {:?}: {}", v, e)))
    };

    headers.insert(HOST, value(&target_authority(target))?);
    headers.insert(X_FORWARDED_HOST, value(original_host)?);
    headers.insert(X_FORWARDED_FOR, value(&remote_addr.ip().to_string())?);
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

    Ok(())
}

/// Error text including the source chain
fn describe(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// Create text response
pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create full body
pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
