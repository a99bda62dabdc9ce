//! Streaming forwarder for backend requests
//!
//! Pooled hyper client that sends the inbound method, headers and body to a
//! resolved backend URL and streams the response back without buffering.

use crate::error::ProxyBody;
use http_body_util::BodyExt;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Response headers relayed from the backend
const RELAYED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_DISPOSITION,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
];

/// Request headers that only apply to a single hop
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("backend unreachable: {0}")]
    Unreachable(#[from] hyper_util::client::legacy::Error),
    #[error("backend did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Configuration for the backend client
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// How long to wait for the backend's response headers
    pub request_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(300),
        }
    }
}

pub struct Forwarder {
    client: Client<HttpConnector, ProxyBody>,
    config: ForwardConfig,
}

impl Forwarder {
    pub fn new(config: ForwardConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend client initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    /// Send `req` to `url`, presenting the backend's own authority as `Host`.
    ///
    /// Backend error statuses are returned as responses, not errors.
    pub async fn forward(&self, req: Request<ProxyBody>, url: &str) -> Result<Response<ProxyBody>, ForwardError> {
        let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| ForwardError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = backend_host(&uri).ok_or_else(|| ForwardError::InvalidUrl {
            url: url.to_string(),
            reason: "missing authority".to_string(),
        })?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            copy_request_headers(&parts.headers, headers);
            headers.insert(header::HOST, host);
        }
        let backend_req = builder.body(body).map_err(|e| ForwardError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let response = tokio::time::timeout(self.config.request_timeout, self.client.request(backend_req))
            .await
            .map_err(|_| ForwardError::Timeout(self.config.request_timeout))??;

        let (parts, body) = response.into_parts();
        let mut relayed = Response::builder().status(parts.status);
        if let Some(headers) = relayed.headers_mut() {
            for name in RELAYED_HEADERS {
                if let Some(value) = parts.headers.get(&name) {
                    headers.insert(name, value.clone());
                }
            }
        }

        relayed
            .body(body.boxed())
            .map_err(|e| ForwardError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

/// `Host` value for a backend URI, without any userinfo
fn backend_host(uri: &Uri) -> Option<HeaderValue> {
    let authority = uri.authority()?.as_str();
    let host = authority.rsplit('@').next().unwrap_or(authority);
    HeaderValue::from_str(host).ok()
}

fn copy_request_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if name == header::HOST || HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}
