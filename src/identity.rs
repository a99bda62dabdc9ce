//! Identity resolution
//!
//! Two ways to learn who a request belongs to:
//! - decoding the base64 username carried in the first path segment
//! - asking the hub to validate a bearer credential

use crate::config::AuthConfig;
use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Path identifier that routes to the loopback backend instead of a user server
pub const LOCAL_MARKER: &str = "localhost";

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// Result of decoding the first path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathIdentity {
    /// A backend account name
    User(String),
    /// The local development marker
    Local,
}

/// Account an authenticated request acts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub email: String,
}

/// Encode a username the way clients embed it in request paths
pub fn encode_username(username: &str) -> String {
    STANDARD.encode(username.as_bytes())
}

/// Decode an encoded path identifier into a backend username.
///
/// Accepts the standard and URL-safe alphabets, with or without padding.
pub fn decode_path_identity(identifier: &str) -> Result<PathIdentity, IdentityError> {
    if identifier == LOCAL_MARKER {
        return Ok(PathIdentity::Local);
    }
    if identifier.is_empty() {
        return Err(IdentityError::MalformedIdentifier("empty identifier".to_string()));
    }

    let bytes = STANDARD_LENIENT
        .decode(identifier)
        .or_else(|_| URL_SAFE_LENIENT.decode(identifier))
        .map_err(|e| IdentityError::MalformedIdentifier(format!("invalid base64: {}", e)))?;

    let username = String::from_utf8(bytes)
        .map_err(|_| IdentityError::MalformedIdentifier("decoded value is not UTF-8".to_string()))?;

    // The marker means loopback however it is spelled in the path
    if username == LOCAL_MARKER {
        return Ok(PathIdentity::Local);
    }

    validate_username(&username)?;
    Ok(PathIdentity::User(username))
}

/// The username ends up inside a URL authority, so reject anything that would split it
fn validate_username(username: &str) -> Result<(), IdentityError> {
    if username.is_empty() {
        return Err(IdentityError::MalformedIdentifier("empty username".to_string()));
    }
    let invalid = username
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#' | ':' | '\\'));
    if invalid {
        return Err(IdentityError::MalformedIdentifier(
            "username contains characters not allowed in a hostname".to_string(),
        ));
    }
    Ok(())
}

/// Validates bearer credentials against an external authority
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Return the account email owning `authorization` (the raw Authorization header value)
    async fn verify_credential(&self, authorization: &str) -> Result<ResolvedIdentity, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct HubUser {
    name: Option<String>,
}

/// Authorizer backed by the hub's `/hub/api/user` endpoint
pub struct HubAuthorizer {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HubAuthorizer {
    pub fn new(config: &AuthConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            endpoint: config.user_endpoint(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Authorizer for HubAuthorizer {
    async fn verify_credential(&self, authorization: &str) -> Result<ResolvedIdentity, IdentityError> {
        if authorization.trim().is_empty() {
            return Err(IdentityError::AuthenticationFailed("missing credential".to_string()));
        }

        let response = self
            .http_client
            .get(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(endpoint = %self.endpoint, error = %e, "Authorization service unreachable");
                IdentityError::AuthenticationFailed("authorization service unreachable".to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = %status, "Credential rejected by authorization service");
            return Err(IdentityError::AuthenticationFailed(format!(
                "authorization service answered {}",
                status.as_u16()
            )));
        }

        let user: HubUser = response.json().await.map_err(|e| {
            IdentityError::AuthenticationFailed(format!("invalid authorization response: {}", e))
        })?;

        match user.name {
            Some(name) if !name.is_empty() => Ok(ResolvedIdentity { email: name }),
            _ => Err(IdentityError::AuthenticationFailed("user not found".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_round_trip() {
        for name in ["alice", "bob@x.com", "j.doe-42", "ünïcode"] {
            let encoded = encode_username(name);
            assert_eq!(
                decode_path_identity(&encoded).unwrap(),
                PathIdentity::User(name.to_string())
            );
        }
    }

    #[test]
    fn test_local_marker() {
        assert_eq!(decode_path_identity("localhost").unwrap(), PathIdentity::Local);
    }

    #[test]
    fn test_encoded_local_marker_is_local() {
        let encoded = encode_username("localhost");
        assert_eq!(decode_path_identity(&encoded).unwrap(), PathIdentity::Local);
        assert_eq!(decode_path_identity("bG9jYWxob3N0").unwrap(), PathIdentity::Local);
        // only the exact marker is special
        assert_eq!(
            decode_path_identity(&encode_username("localhost2")).unwrap(),
            PathIdentity::User("localhost2".to_string())
        );
    }

    #[test]
    fn test_decode_accepts_unpadded_and_url_safe() {
        // "alice" -> "YWxpY2U="
        assert_eq!(
            decode_path_identity("YWxpY2U").unwrap(),
            PathIdentity::User("alice".to_string())
        );
        // ">>>" encodes to "Pj4+" in the standard alphabet, "Pj4-" in the URL-safe one
        assert_eq!(
            decode_path_identity("Pj4-").unwrap(),
            PathIdentity::User(">>>".to_string())
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_path_identity("!!not-base64!!"),
            Err(IdentityError::MalformedIdentifier(_))
        ));
        assert!(matches!(
            decode_path_identity(""),
            Err(IdentityError::MalformedIdentifier(_))
        ));
        // valid base64 of invalid UTF-8
        assert!(matches!(
            decode_path_identity("//79"),
            Err(IdentityError::MalformedIdentifier(_))
        ));
    }

    #[test]
    fn test_decode_rejects_authority_breaking_usernames() {
        for name in ["evil/path", "host:80", "a b", "q?x"] {
            let encoded = encode_username(name);
            assert!(
                decode_path_identity(&encoded).is_err(),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_hub_authorizer_endpoint() {
        let config = AuthConfig {
            hub_host: "hub.example.com".to_string(),
            hub_scheme: "https".to_string(),
            timeout_secs: 5,
        };
        let authorizer = HubAuthorizer::new(&config).unwrap();
        assert_eq!(authorizer.endpoint(), "https://hub.example.com/hub/api/user");
    }

    #[tokio::test]
    async fn test_hub_authorizer_rejects_empty_credential() {
        let authorizer = HubAuthorizer::new(&AuthConfig::default()).unwrap();
        let err = authorizer.verify_credential("  ").await.unwrap_err();
        assert!(matches!(err, IdentityError::AuthenticationFailed(_)));
    }

    /// Hub stand-in: `token good` is bob, `token nameless` has no name, anything else is 403
    async fn spawn_hub() -> std::net::SocketAddr {
        use hyper::body::Incoming;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        assert_eq!(req.uri().path(), "/hub/api/user");
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let (status, body) = match auth.as_str() {
                            "token good" => (StatusCode::OK, r#"{"name":"bob@x.com","admin":false}"#),
                            "token nameless" => (StatusCode::OK, r#"{"kind":"service"}"#),
                            _ => (StatusCode::FORBIDDEN, r#"{"status":403}"#),
                        };
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(status)
                                .header("content-type", "application/json")
                                .body(crate::error::full_body(body))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_hub_authorizer_against_stub_hub() {
        let addr = spawn_hub().await;
        let authorizer = HubAuthorizer::new(&AuthConfig {
            hub_host: addr.to_string(),
            hub_scheme: "http".to_string(),
            timeout_secs: 5,
        })
        .unwrap();

        let identity = authorizer.verify_credential("token good").await.unwrap();
        assert_eq!(identity.email, "bob@x.com");

        let err = authorizer.verify_credential("token bad").await.unwrap_err();
        assert!(matches!(err, IdentityError::AuthenticationFailed(m) if m.contains("403")));

        let err = authorizer.verify_credential("token nameless").await.unwrap_err();
        assert!(matches!(err, IdentityError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_hub_authorizer_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let authorizer = HubAuthorizer::new(&AuthConfig {
            hub_host: addr.to_string(),
            hub_scheme: "http".to_string(),
            timeout_secs: 2,
        })
        .unwrap();
        let err = authorizer.verify_credential("token good").await.unwrap_err();
        assert!(matches!(err, IdentityError::AuthenticationFailed(_)));
    }
}
