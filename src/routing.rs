//! Backend resolution
//!
//! Requests for the primary host carry the encoded account name in the first
//! path segment (direct mode). Any other host is a custom domain and is looked
//! up in the registry (domain mode). Both produce a [`BackendTarget`].

use crate::config::RoutingConfig;
use crate::identity::{decode_path_identity, IdentityError, PathIdentity};
use crate::registry::{DomainRegistry, RegistryError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("no binding for domain {0}")]
    DomainNotFound(String),
    #[error("no route for {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<RegistryError> for RoutingError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidDomain(domain) => RoutingError::DomainNotFound(domain),
            RegistryError::Storage(e) => RoutingError::Storage(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Direct,
    Domain,
}

/// Where a proxied request goes.
///
/// `endpoint_type` and `token` are path-safe segments, appended as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub base_url: String,
    pub endpoint_type: Option<String>,
    pub token: Option<String>,
    pub query: Option<String>,
}

impl BackendTarget {
    /// Full backend URL: base, optional segments, then the query or a trailing slash
    pub fn url(&self) -> String {
        let mut url = self.base_url.clone();
        for segment in [&self.endpoint_type, &self.token].into_iter().flatten() {
            url.push('/');
            url.push_str(segment);
        }
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => {
                url.push('?');
                url.push_str(query);
            }
            _ => url.push('/'),
        }
        url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Bare root of the primary host
    Index,
    Proxy(BackendTarget),
}

/// One raw path segment plus its percent-decoded form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub raw: String,
    pub decoded: String,
}

/// Split a request path into its non-empty segments
pub fn path_segments(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|raw| Segment {
            raw: raw.to_string(),
            decoded: urlencoding::decode(raw)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| raw.to_string()),
        })
        .collect()
}

#[derive(Clone)]
pub struct Router {
    config: RoutingConfig,
    registry: DomainRegistry,
}

impl Router {
    pub fn new(config: RoutingConfig, registry: DomainRegistry) -> Self {
        Self { config, registry }
    }

    pub fn mode(&self, host: &str) -> RouteMode {
        if host.eq_ignore_ascii_case(&self.config.primary_host) {
            RouteMode::Direct
        } else {
            RouteMode::Domain
        }
    }

    /// Base URL of a user's backend server
    pub fn base_url(&self, identity: &PathIdentity) -> String {
        match identity {
            PathIdentity::User(username) => format!(
                "{}{}{}:{}",
                self.config.backend_prefix, username, self.config.backend_suffix, self.config.backend_port
            ),
            PathIdentity::Local => format!("http://localhost:{}", self.config.backend_port),
        }
    }

    /// Resolve a request by host, path and raw query string
    pub async fn resolve(
        &self,
        host: &str,
        path: &str,
        query: Option<&str>,
    ) -> Result<Resolution, RoutingError> {
        let segments = path_segments(path);
        match self.mode(host) {
            RouteMode::Direct => self.resolve_direct(&segments, query),
            RouteMode::Domain => Ok(Resolution::Proxy(
                self.resolve_domain(host, &segments, query).await?,
            )),
        }
    }

    /// `/{identifier}[/{endpointType}[/{token}]]`
    pub fn resolve_direct(
        &self,
        segments: &[Segment],
        query: Option<&str>,
    ) -> Result<Resolution, RoutingError> {
        let (identifier, rest) = match segments.split_first() {
            Some(split) => split,
            None => return Ok(Resolution::Index),
        };
        if rest.len() > 2 {
            return Err(RoutingError::NotFound(format!("/{}", join_raw(segments))));
        }

        let identity = decode_path_identity(&identifier.decoded)?;
        debug!(identity = ?identity, "Resolved path identifier");

        Ok(Resolution::Proxy(BackendTarget {
            base_url: self.base_url(&identity),
            endpoint_type: rest.first().map(|s| s.raw.clone()),
            token: rest.get(1).map(|s| s.raw.clone()),
            query: query.map(str::to_string),
        }))
    }

    /// `[/{endpointType}[/{token}]]` on a registered custom domain
    pub async fn resolve_domain(
        &self,
        host: &str,
        segments: &[Segment],
        query: Option<&str>,
    ) -> Result<BackendTarget, RoutingError> {
        if segments.len() > 2 {
            return Err(RoutingError::NotFound(format!("/{}", join_raw(segments))));
        }
        let endpoint_type = segments.first();
        let token = segments.get(1);

        let binding = self
            .registry
            .find_by_domain(
                host,
                token.map(|s| s.decoded.as_str()),
                endpoint_type.map(|s| s.decoded.as_str()),
            )
            .await?
            .ok_or_else(|| RoutingError::DomainNotFound(host.to_string()))?;

        debug!(domain = host, owner = %binding.owner_email, "Resolved custom domain");

        // Request segments win over the stored defaults
        let stored = |value: Option<String>| value.map(|v| urlencoding::encode(&v).into_owned());
        Ok(BackendTarget {
            base_url: self.base_url(&PathIdentity::User(binding.owner_email)),
            endpoint_type: endpoint_type
                .map(|s| s.raw.clone())
                .or_else(|| stored(binding.endpoint_type)),
            token: token.map(|s| s.raw.clone()).or_else(|| stored(binding.access_token)),
            query: query.map(str::to_string),
        })
    }
}

fn join_raw(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| s.raw.as_str())
        .collect::<Vec<_>>()
        .join("/")
}
