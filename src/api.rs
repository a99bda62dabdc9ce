//! Registration API
//!
//! `POST`, `GET` and `DELETE` on `/proxy` (and its `/runner` alias) manage the
//! caller's custom domain bindings. Every call needs a bearer credential that
//! the authorization service accepts. Certificates follow the bindings:
//! registering issues one, deleting revokes it.

use crate::certs::CertError;
use crate::db::DomainBinding;
use crate::error::{json_error_response, json_response, ProxyBody, ProxyErrorCode};
use crate::identity::{Authorizer, IdentityError, ResolvedIdentity};
use crate::lifecycle::CertificateManager;
use crate::registry::{DomainRegistry, RegistryError};
use http_body_util::{BodyExt, Limited};
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(anyhow::Error),
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidDomain(reason) => ApiError::InvalidRequest(reason),
            RegistryError::Storage(e) => ApiError::Storage(e),
        }
    }
}

impl ApiError {
    pub fn into_response(self) -> Response<ProxyBody> {
        match self {
            ApiError::Identity(IdentityError::AuthenticationFailed(reason)) => {
                json_error_response(ProxyErrorCode::AuthenticationFailed, reason)
            }
            ApiError::Identity(IdentityError::MalformedIdentifier(reason)) => {
                json_error_response(ProxyErrorCode::MalformedIdentifier, reason)
            }
            ApiError::InvalidRequest(reason) => json_error_response(ProxyErrorCode::InvalidRequest, reason),
            ApiError::Storage(e) => {
                error!(error = %e, "Registry storage failure");
                json_error_response(ProxyErrorCode::StorageError, "Storage unavailable")
            }
        }
    }
}

/// Body of create and delete calls
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingRequest {
    pub domain: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "endPointType")]
    pub endpoint_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    #[serde(flatten)]
    pub binding: DomainBinding,
    pub certificate_issued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub deleted: usize,
    pub certificate_revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_error: Option<String>,
}

pub struct RegistrationApi {
    registry: DomainRegistry,
    certificates: Arc<CertificateManager>,
    authorizer: Arc<dyn Authorizer>,
}

impl RegistrationApi {
    pub fn new(
        registry: DomainRegistry,
        certificates: Arc<CertificateManager>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            registry,
            certificates,
            authorizer,
        }
    }

    /// Resolve the caller from the Authorization header
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<ResolvedIdentity, ApiError> {
        let credential = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| IdentityError::AuthenticationFailed("missing Authorization header".to_string()))?;

        Ok(self.authorizer.verify_credential(credential).await?)
    }

    /// Save the binding, then try to issue its certificate.
    ///
    /// Issuance failure does not undo the binding.
    pub async fn create(
        &self,
        identity: &ResolvedIdentity,
        request: BindingRequest,
    ) -> Result<CreateResponse, ApiError> {
        let binding = self
            .registry
            .upsert_binding(
                &identity.email,
                &request.domain,
                request.endpoint_type.as_deref(),
                request.token.as_deref(),
            )
            .await?;

        let (certificate_issued, certificate_error) = match self.certificates.issue(&binding.domain).await {
            Ok(_) => (true, None),
            Err(e) => {
                warn!(domain = %binding.domain, error = %e, "Domain registered without certificate");
                (false, Some(soft_failure(&e)))
            }
        };

        Ok(CreateResponse {
            binding,
            certificate_issued,
            certificate_error,
        })
    }

    pub async fn list(&self, identity: &ResolvedIdentity) -> Result<Vec<DomainBinding>, ApiError> {
        Ok(self.registry.list_bindings(&identity.email).await?)
    }

    /// Delete matching bindings, then revoke the domain's certificate once nobody binds it
    pub async fn delete(
        &self,
        identity: &ResolvedIdentity,
        request: BindingRequest,
    ) -> Result<DeleteResponse, ApiError> {
        let deleted = self
            .registry
            .delete_binding(
                &identity.email,
                &request.domain,
                request.token.as_deref(),
                request.endpoint_type.as_deref(),
            )
            .await?;

        // A certificate lives until its domain leaves the registry: revoke once the
        // last binding is gone, whatever this call removed. Another account's
        // binding keeps it alive.
        let domain = crate::registry::normalize_domain(&request.domain)?;
        if self.registry.find_by_domain(&domain, None, None).await?.is_some() {
            debug!(domain = %domain, "Domain still bound, keeping certificate");
            return Ok(DeleteResponse {
                deleted,
                certificate_revoked: false,
                certificate_error: None,
            });
        }

        let (certificate_revoked, certificate_error) = match self.certificates.revoke(&domain).await {
            Ok(removed) => (removed, None),
            Err(e) => (false, Some(soft_failure(&e))),
        };

        Ok(DeleteResponse {
            deleted,
            certificate_revoked,
            certificate_error,
        })
    }

    /// Serve one HTTP request on the registration path
    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let method = req.method().clone();
        if method != Method::GET && method != Method::POST && method != Method::DELETE {
            return json_error_response(ProxyErrorCode::MethodNotAllowed, "Use GET, POST or DELETE");
        }

        let result: Result<Response<ProxyBody>, ApiError> = async {
            let identity = self.authenticate(req.headers()).await?;
            debug!(%method, owner = %identity.email, "Registration API request");

            if method == Method::GET {
                return to_json(StatusCode::OK, &self.list(&identity).await?);
            }

            let body = read_binding_request(req).await?;
            if method == Method::POST {
                to_json(StatusCode::OK, &self.create(&identity, body).await?)
            } else {
                to_json(StatusCode::OK, &self.delete(&identity, body).await?)
            }
        }
        .await;

        result.unwrap_or_else(ApiError::into_response)
    }
}

fn soft_failure(err: &CertError) -> String {
    match err {
        CertError::Storage(_) => "certificate store unavailable".to_string(),
        other => other.to_string(),
    }
}

async fn read_binding_request(req: Request<ProxyBody>) -> Result<BindingRequest, ApiError> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Failed to read body: {}", e)))?
        .to_bytes();

    let request: BindingRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON: {}", e)))?;
    if request.domain.trim().is_empty() {
        return Err(ApiError::InvalidRequest("domain is required".to_string()));
    }
    Ok(request)
}

fn to_json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<ProxyBody>, ApiError> {
    let body = serde_json::to_string(value).map_err(|e| ApiError::Storage(e.into()))?;
    Ok(json_response(status, body))
}
