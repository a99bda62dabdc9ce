//! HTTP(S) front end
//!
//! Accepts connections (plain or TLS with per-handshake certificate selection),
//! stamps request ids and forwarding headers, then dispatches: challenge files,
//! the registration API, the authenticated runner route and finally backend
//! resolution through the router.

use crate::api::RegistrationApi;
use crate::error::{full_body, json_error_response, json_response, ProxyBody, ProxyErrorCode};
use crate::forward::{ForwardError, Forwarder};
use crate::identity::IdentityError;
use crate::issuer::Http01Challenges;
use crate::routing::{path_segments, Resolution, Router, RoutingError, Segment};
use crate::tls::SniSelector;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
const WELL_KNOWN_PREFIX: &str = "/.well-known/";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Everything a request handler needs, shared by all listeners
pub struct ProxyState {
    pub router: Router,
    pub api: RegistrationApi,
    pub forwarder: Forwarder,
    pub challenges: Http01Challenges,
    /// Directory served under `/.well-known/`, only set when TLS is enabled
    pub webroot: Option<PathBuf>,
}

/// One listening socket of the proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
    tls: Option<SniSelector>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<ProxyState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            tls: None,
        }
    }

    /// Terminate TLS on this listener, choosing certificates by SNI
    pub fn with_tls(mut self, selector: SniSelector) -> Self {
        self.tls = Some(selector);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls.is_some() { "HTTPS" } else { "HTTP" };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls = self.tls.clone();

                            tokio::spawn(async move {
                                if let Some(selector) = tls {
                                    match selector.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(protocol, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Challenge responses must work before any certificate exists
    if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        if let Some(key_auth) = state.challenges.get(token).await {
            debug!(token, "Responding to ACME HTTP-01 challenge");
            return Ok(text_response(StatusCode::OK, key_auth));
        }
    }
    if let Some(webroot) = &state.webroot {
        if let Some(relative) = req.uri().path().strip_prefix(WELL_KNOWN_PREFIX) {
            return Ok(serve_well_known(webroot, relative).await);
        }
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let req = req.map(|body| body.boxed());
    let mut response = dispatch(req, &state, &hostname).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn dispatch(req: Request<ProxyBody>, state: &ProxyState, hostname: &str) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let segments = path_segments(&path);

    match segments.first().map(|s| s.raw.as_str()) {
        Some("proxy") | Some("runner") if segments.len() == 1 => return state.api.handle(req).await,
        Some("runner") if segments.len() == 4 => return runner(req, state, &segments[1..], query).await,
        Some("runner") => {
            return json_error_response(
                ProxyErrorCode::NotFound,
                "Runner paths are /runner/{identifier}/{endpointType}/{token}",
            )
        }
        _ => {}
    }

    if req.method() != Method::GET && req.method() != Method::POST {
        return json_error_response(ProxyErrorCode::MethodNotAllowed, "Only GET and POST are proxied");
    }

    match state.router.resolve(hostname, &path, query.as_deref()).await {
        Ok(Resolution::Index) => json_response(StatusCode::OK, r#"{"status":"ok"}"#),
        Ok(Resolution::Proxy(target)) => forward(req, state, &target.url()).await,
        Err(e) => routing_error_response(e),
    }
}

/// `/runner/{identifier}/{endpointType}/{token}`: direct routing behind a credential check
async fn runner(
    req: Request<ProxyBody>,
    state: &ProxyState,
    segments: &[Segment],
    query: Option<String>,
) -> Response<ProxyBody> {
    let identity = match state.api.authenticate(req.headers()).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };
    debug!(caller = %identity.email, "Runner request authorized");

    match state.router.resolve_direct(segments, query.as_deref()) {
        Ok(Resolution::Proxy(target)) => forward(req, state, &target.url()).await,
        Ok(Resolution::Index) => json_response(StatusCode::OK, r#"{"status":"ok"}"#),
        Err(e) => routing_error_response(e),
    }
}

async fn forward(req: Request<ProxyBody>, state: &ProxyState, url: &str) -> Response<ProxyBody> {
    match state.forwarder.forward(req, url).await {
        Ok(response) => response,
        Err(ForwardError::Timeout(timeout)) => {
            warn!(url, timeout_secs = timeout.as_secs(), "Request timed out");
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            )
        }
        Err(e) => {
            // Details stay in the log
            warn!(url, error = %e, "Failed to forward request");
            json_error_response(ProxyErrorCode::BackendUnreachable, "Failed to connect to backend")
        }
    }
}

fn routing_error_response(err: RoutingError) -> Response<ProxyBody> {
    match err {
        RoutingError::Identity(IdentityError::MalformedIdentifier(reason)) => {
            json_error_response(ProxyErrorCode::MalformedIdentifier, reason)
        }
        RoutingError::Identity(IdentityError::AuthenticationFailed(reason)) => {
            json_error_response(ProxyErrorCode::AuthenticationFailed, reason)
        }
        RoutingError::DomainNotFound(_) => json_error_response(ProxyErrorCode::DomainNotFound, "domain not found"),
        RoutingError::NotFound(path) => json_error_response(ProxyErrorCode::NotFound, format!("No route for {}", path)),
        RoutingError::Storage(e) => {
            error!(error = %e, "Registry lookup failed");
            json_error_response(ProxyErrorCode::StorageError, "Storage unavailable")
        }
    }
}

/// Serve a file below the webroot's `.well-known` directory
async fn serve_well_known(webroot: &Path, relative: &str) -> Response<ProxyBody> {
    let relative = match urlencoding::decode(relative) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => return json_error_response(ProxyErrorCode::NotFound, "Not found"),
    };

    let relative_path = Path::new(&relative);
    let safe = !relative.is_empty()
        && !relative.contains('\\')
        && relative_path.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        debug!(path = %relative, "Rejected well-known path");
        return json_error_response(ProxyErrorCode::NotFound, "Not found");
    }

    let file = webroot.join(".well-known").join(relative_path);
    match tokio::fs::read(&file).await {
        Ok(contents) => text_response(StatusCode::OK, contents),
        Err(_) => json_error_response(ProxyErrorCode::NotFound, "Not found"),
    }
}

fn text_response(status: StatusCode, body: impl Into<hyper::body::Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    // Strip port if present
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only, which also keeps log lines clean
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.trim_end_matches('.').to_lowercase())
}
