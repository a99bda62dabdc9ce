//! Custom domain registry
//!
//! Maps a custom domain to the account that owns it, optionally narrowed by an
//! endpoint type and access token. Registration mutates it; routing only reads.

use crate::db::{Database, DomainBinding};
use thiserror::Error;
use tracing::{debug, info};

/// Maximum hostname length (RFC 1035)
const MAX_DOMAIN_LEN: usize = 253;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Domain registry backed by the persistent store
#[derive(Clone)]
pub struct DomainRegistry {
    db: Database,
}

impl DomainRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Find the (owner, domain) binding or create it, then apply whichever optional fields were supplied
    pub async fn upsert_binding(
        &self,
        owner_email: &str,
        domain: &str,
        endpoint_type: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<DomainBinding, RegistryError> {
        let domain = normalize_domain(domain)?;
        let owner = owner_email.to_string();
        let endpoint_type = non_empty(endpoint_type);
        let access_token = non_empty(access_token);

        let binding = self
            .db
            .run_blocking(move |db| {
                db.upsert_binding(&owner, &domain, endpoint_type.as_deref(), access_token.as_deref())
            })
            .await?;

        info!(
            domain = %binding.domain,
            owner = %binding.owner_email,
            endpoint_type = ?binding.endpoint_type,
            "Domain binding saved"
        );
        Ok(binding)
    }

    /// Bindings owned by an account, in registration order
    pub async fn list_bindings(&self, owner_email: &str) -> Result<Vec<DomainBinding>, RegistryError> {
        let owner = owner_email.to_string();
        let bindings = self.db.run_blocking(move |db| db.list_bindings(&owner)).await?;
        Ok(bindings)
    }

    /// Delete bindings matching all four fields exactly; returns how many went away
    pub async fn delete_binding(
        &self,
        owner_email: &str,
        domain: &str,
        access_token: Option<&str>,
        endpoint_type: Option<&str>,
    ) -> Result<usize, RegistryError> {
        let domain = normalize_domain(domain)?;
        let owner = owner_email.to_string();
        let access_token = non_empty(access_token);
        let endpoint_type = non_empty(endpoint_type);

        let log_domain = domain.clone();
        let deleted = self
            .db
            .run_blocking(move |db| {
                db.delete_bindings(&owner, &domain, access_token.as_deref(), endpoint_type.as_deref())
            })
            .await?;

        info!(domain = %log_domain, owner = owner_email, deleted, "Domain binding delete");
        Ok(deleted)
    }

    /// Look up the binding serving `domain`; the optional filters only narrow the match
    pub async fn find_by_domain(
        &self,
        domain: &str,
        access_token: Option<&str>,
        endpoint_type: Option<&str>,
    ) -> Result<Option<DomainBinding>, RegistryError> {
        let domain = match normalize_domain(domain) {
            Ok(d) => d,
            Err(_) => {
                debug!(domain, "Lookup for invalid domain");
                return Ok(None);
            }
        };
        let access_token = non_empty(access_token);
        let endpoint_type = non_empty(endpoint_type);

        let binding = self
            .db
            .run_blocking(move |db| {
                db.find_binding_by_domain(&domain, access_token.as_deref(), endpoint_type.as_deref())
            })
            .await?;
        Ok(binding)
    }
}

/// Normalize a domain name (lowercase, trim whitespace, trailing dot)
pub fn normalize_domain(domain: &str) -> Result<String, RegistryError> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();

    if domain.is_empty() {
        return Err(RegistryError::InvalidDomain("domain cannot be empty".to_string()));
    }

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(RegistryError::InvalidDomain("domain name too long".to_string()));
    }

    let valid_chars = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid_chars {
        return Err(RegistryError::InvalidDomain(format!(
            "'{}' contains invalid characters",
            domain
        )));
    }

    if domain.split('.').any(|label| label.is_empty()) {
        return Err(RegistryError::InvalidDomain(format!("'{}' has an empty label", domain)));
    }

    Ok(domain)
}

/// Empty strings count as "not supplied"
fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}
