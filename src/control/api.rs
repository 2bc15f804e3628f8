//! Control API served over the control socket
//!
//! | Method | Path          | Body                    | Response             |
//! |--------|---------------|-------------------------|----------------------|
//! | GET    | `/api/health` |                         | `{"status":"ok"}`    |
//! | GET    | `/api/list`   |                         | `[{"domain","target"}]` |
//! | POST   | `/api/add`    | `{"domain","target"}`   | `ok`                 |
//! | POST   | `/api/remove` | `{"domain"}`            | `ok`                 |

use crate::error::Error;
use crate::proxy::{full_body, text_response, ProxyBody};
use crate::store::RouteStore;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info};

/// Largest accepted control request body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// One entry of the `list` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub domain: String,
    pub target: String,
}

/// Body of `POST /api/add`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddRequest {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub target: String,
}

/// Body of `POST /api/remove`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveRequest {
    #[serde(default)]
    pub domain: String,
}

/// Control request handler
#[derive(Clone)]
pub struct ControlApi {
    store: Arc<RouteStore>,
}

impl ControlApi {
    pub fn new(store: Arc<RouteStore>) -> Self {
        Self { store }
    }

    /// Dispatch a control request
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, Infallible>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match path.as_str() {
            "/api/health" if method == Method::GET => {
                json_response(&serde_json::json!({ "status": "ok" }))
            }
            "/api/list" if method == Method::GET => self.list(),
            "/api/add" if method == Method::POST => self.add(req).await,
            "/api/remove" if method == Method::POST => self.remove(req).await,
            "/api/health" | "/api/list" | "/api/add" | "/api/remove" => {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        };

        Ok(response)
    }

    fn list(&self) -> Response<ProxyBody> {
        match self.store.list() {
            Ok(routes) => {
                let entries: Vec<RouteEntry> = routes
                    .into_iter()
                    .map(|r| RouteEntry {
                        domain: r.domain,
                        target: r.target,
                    })
                    .collect();
                json_response(&entries)
            }
            Err(e) => store_failure(e),
        }
    }

    async fn add<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body: AddRequest = match decode(req).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        if body.domain.is_empty() || body.target.is_empty() {
            return text_response(StatusCode::BAD_REQUEST, "domain and target required");
        }

        match self.store.upsert(&body.domain, &body.target) {
            Ok(()) => {
                info!("Route added: {} -> {}", body.domain, body.target);
                text_response(StatusCode::OK, "ok")
            }
            Err(e) => store_failure(e),
        }
    }

    async fn remove<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body: RemoveRequest = match decode(req).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        if body.domain.is_empty() {
            return text_response(StatusCode::BAD_REQUEST, "domain required");
        }

        match self.store.remove(&body.domain) {
            Ok(existed) => {
                if existed {
                    info!("Route removed: {}", body.domain);
                }
                text_response(StatusCode::OK, "ok")
            }
            Err(e) => store_failure(e),
        }
    }
}

/// Read and decode a JSON body, or produce the error response
async fn decode<T, B>(req: Request<B>) -> Result<T, Response<ProxyBody>>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(text_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
        Err(e) => return Err(text_response(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    serde_json::from_slice(&bytes).map_err(|e| text_response(StatusCode::BAD_REQUEST, &e.to_string()))
}

fn store_failure(e: Error) -> Response<ProxyBody> {
    match e {
        Error::Validation(msg) => text_response(StatusCode::BAD_REQUEST, &msg),
        e => {
            error!("Control request failed: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(json) => {
            let mut response = Response::new(full_body(Bytes::from(json)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}
