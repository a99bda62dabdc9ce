//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response body type shared by every handler
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Path identifier is not a valid encoded username
    MalformedIdentifier,
    /// Bearer credential missing or rejected by the hub
    AuthenticationFailed,
    /// Custom domain has no binding
    DomainNotFound,
    /// Path does not match any route
    NotFound,
    /// Method not supported on this route
    MethodNotAllowed,
    /// Request body or parameters are invalid
    InvalidRequest,
    /// Failed to connect to backend
    BackendUnreachable,
    /// Backend did not answer in time
    RequestTimeout,
    /// Persistent store failure
    StorageError,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::MalformedIdentifier => StatusCode::BAD_REQUEST,
            ProxyErrorCode::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::DomainNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            // Proxy-side failures stay in the 4xx range so they never look like
            // a 5xx relayed from the backend itself
            ProxyErrorCode::BackendUnreachable => StatusCode::FAILED_DEPENDENCY,
            ProxyErrorCode::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            ProxyErrorCode::StorageError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::MalformedIdentifier => "MALFORMED_IDENTIFIER",
            ProxyErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ProxyErrorCode::DomainNotFound => "DOMAIN_NOT_FOUND",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::StorageError => "STORAGE_ERROR",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a JSON success response
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}
