//! Certificate store: one key/certificate pair per domain

use crate::db::{CertificateRecord, Database};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate issuance failed for {domain}: {reason}")]
    IssuanceFailed { domain: String, reason: String },
    #[error("certificate revocation failed for {domain}: {reason}")]
    RevocationFailed { domain: String, reason: String },
    #[error("no certificate for domain {0}")]
    NoCertificateForDomain(String),
    #[error("invalid certificate material for {domain}: {reason}")]
    InvalidMaterial { domain: String, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Persistent per-domain TLS material
#[derive(Clone)]
pub struct CertificateStore {
    db: Database,
}

impl CertificateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, domain: &str) -> Result<Option<CertificateRecord>, CertError> {
        let domain = domain.to_ascii_lowercase();
        let record = self.db.run_blocking(move |db| db.get_certificate(&domain)).await?;
        Ok(record)
    }

    /// Store material, replacing any previous record for the domain
    pub async fn put(&self, domain: &str, private_key: &str, certificate: &str) -> Result<(), CertError> {
        let domain = domain.to_ascii_lowercase();
        let key = private_key.to_string();
        let cert = certificate.to_string();
        self.db
            .run_blocking(move |db| db.put_certificate(&domain, &key, &cert))
            .await?;
        Ok(())
    }

    /// Remove the record; `false` when there was none
    pub async fn delete(&self, domain: &str) -> Result<bool, CertError> {
        let domain = domain.to_ascii_lowercase();
        let deleted = self.db.run_blocking(move |db| db.delete_certificate(&domain)).await?;
        Ok(deleted)
    }

    pub async fn exists(&self, domain: &str) -> Result<bool, CertError> {
        Ok(self.get(domain).await?.is_some())
    }

    pub async fn list_domains(&self) -> Result<Vec<String>, CertError> {
        let domains = self.db.run_blocking(|db| db.list_certificate_domains()).await?;
        Ok(domains)
    }
}

impl CertificateRecord {
    /// Expiry of the leaf certificate, if the PEM parses
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        pem_expiry(&self.certificate)
    }

    /// Whether the leaf stays valid for at least `days` more days
    pub fn is_valid_for_days(&self, days: u64) -> bool {
        match self.expires_at() {
            Some(expiry) => {
                let remaining = expiry.signed_duration_since(Utc::now());
                let valid = remaining.num_days() >= days as i64;
                debug!(
                    domain = %self.domain,
                    remaining_days = remaining.num_days(),
                    required_days = days,
                    valid,
                    "Certificate validity check"
                );
                valid
            }
            None => false,
        }
    }
}

/// `notAfter` of the first certificate in a PEM bundle
pub fn pem_expiry(pem: &str) -> Option<DateTime<Utc>> {
    let (_, pem) = match x509_parser::pem::parse_x509_pem(pem.as_bytes()) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(error = %e, "Failed to parse certificate PEM");
            return None;
        }
    };

    let cert = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return None;
        }
    };

    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
}
