//! Certificate lifecycle
//!
//! Keeps the certificate store in step with the certificate authority:
//! issue on registration, revoke on deletion, bootstrap the primary host
//! and renew anything close to expiry.

use crate::certs::{CertError, CertificateStore};
use crate::db::CertificateRecord;
use crate::issuer::CertificateAuthority;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often stored certificates are checked for renewal
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub struct CertificateManager {
    store: CertificateStore,
    authority: Arc<dyn CertificateAuthority>,
    primary_host: String,
    renew_before_days: u64,
    in_flight: Mutex<HashSet<String>>,
}

impl CertificateManager {
    pub fn new(
        store: CertificateStore,
        authority: Arc<dyn CertificateAuthority>,
        primary_host: impl Into<String>,
        renew_before_days: u64,
    ) -> Self {
        Self {
            store,
            authority,
            primary_host: primary_host.into().to_ascii_lowercase(),
            renew_before_days,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Obtain a certificate for `domain` and store it, replacing any previous one.
    ///
    /// On failure the store is left untouched.
    pub async fn issue(&self, domain: &str) -> Result<CertificateRecord, CertError> {
        let domain = domain.to_ascii_lowercase();
        let _guard = match InFlightGuard::acquire(&self.in_flight, &domain) {
            Some(guard) => guard,
            None => {
                return Err(CertError::IssuanceFailed {
                    domain,
                    reason: "issuance already in progress".to_string(),
                })
            }
        };

        let issued = self.authority.issue(&domain).await.map_err(|e| {
            warn!(domain = %domain, error = %e, "Certificate issuance failed");
            CertError::IssuanceFailed {
                domain: domain.clone(),
                reason: e.to_string(),
            }
        })?;

        if crate::tls::server_config_from_pem(&domain, &issued.certificate_pem, &issued.private_key_pem)
            .is_err()
        {
            warn!(domain = %domain, "Certificate authority returned unusable material");
            return Err(CertError::IssuanceFailed {
                domain,
                reason: "issued material does not form a usable key pair".to_string(),
            });
        }

        self.store
            .put(&domain, &issued.private_key_pem, &issued.certificate_pem)
            .await?;
        let record = self
            .store
            .get(&domain)
            .await?
            .ok_or_else(|| CertError::Storage(anyhow::anyhow!("certificate for {} vanished after write", domain)))?;
        info!(domain = %domain, expires_at = ?record.expires_at(), "Certificate issued and stored");
        Ok(record)
    }

    /// Revoke and forget the certificate for `domain`.
    ///
    /// The local record is deleted even when revocation fails; the failure is
    /// still returned. `Ok(false)` means there was nothing stored.
    pub async fn revoke(&self, domain: &str) -> Result<bool, CertError> {
        let domain = domain.to_ascii_lowercase();
        let record = self.store.get(&domain).await?;

        let revocation = match &record {
            Some(record) => self.authority.revoke(&domain, &record.certificate).await,
            None => {
                debug!(domain = %domain, "No stored certificate to revoke");
                Ok(())
            }
        };

        let deleted = self.store.delete(&domain).await?;

        match revocation {
            Ok(()) => {
                if deleted {
                    info!(domain = %domain, "Certificate revoked and removed");
                }
                Ok(deleted)
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, deleted, "Certificate revocation failed");
                Err(CertError::RevocationFailed {
                    domain,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Issue a certificate for the primary host unless one is already stored.
    ///
    /// Returns whether an issuance happened.
    pub async fn ensure_primary_certificate(&self) -> Result<bool, CertError> {
        if self.store.exists(&self.primary_host).await? {
            debug!(domain = %self.primary_host, "Primary host certificate present");
            return Ok(false);
        }

        info!(domain = %self.primary_host, "Issuing primary host certificate");
        self.issue(&self.primary_host).await?;
        Ok(true)
    }

    /// Re-issue every stored certificate expiring within the renewal window.
    ///
    /// Returns how many were renewed. Failures leave the old material in place.
    pub async fn renew_due(&self) -> Result<usize, CertError> {
        let domains = self.store.list_domains().await?;
        info!(domain_count = domains.len(), "Checking certificates for renewal");

        let mut renewed = 0;
        for domain in domains {
            let record = match self.store.get(&domain).await? {
                Some(record) => record,
                None => continue,
            };
            if record.is_valid_for_days(self.renew_before_days) {
                continue;
            }

            info!(domain = %domain, expires_at = ?record.expires_at(), "Certificate needs renewal");
            match self.issue(&domain).await {
                Ok(_) => renewed += 1,
                Err(e) => error!(domain = %domain, error = %e, "Failed to renew certificate"),
            }
        }
        Ok(renewed)
    }

    /// Run the renewal sweep until shutdown
    pub async fn run_renewal(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            check_interval_hours = RENEWAL_INTERVAL.as_secs() / 3600,
            renew_before_days = self.renew_before_days,
            "Starting certificate renewal scheduler"
        );

        let mut interval = tokio::time::interval(RENEWAL_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.renew_due().await {
                        error!(error = %e, "Certificate renewal check failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Certificate renewal scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Marks a domain as being issued until dropped
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    domain: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, domain: &str) -> Option<Self> {
        if !set.lock().insert(domain.to_string()) {
            return None;
        }
        Some(Self {
            set,
            domain: domain.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.domain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::issuer::IssuedCertificate;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubAuthority {
        fail_issue: AtomicBool,
        fail_revoke: AtomicBool,
        issued: AtomicUsize,
        revoked: AtomicUsize,
    }

    #[async_trait]
    impl CertificateAuthority for StubAuthority {
        async fn issue(&self, domain: &str) -> anyhow::Result<IssuedCertificate> {
            if self.fail_issue.load(Ordering::SeqCst) {
                anyhow::bail!("rate limited");
            }
            self.issued.fetch_add(1, Ordering::SeqCst);
            let rcgen::CertifiedKey { cert, key_pair } =
                rcgen::generate_simple_self_signed(vec![domain.to_string()])?;
            Ok(IssuedCertificate {
                private_key_pem: key_pair.serialize_pem(),
                certificate_pem: cert.pem(),
            })
        }

        async fn revoke(&self, _domain: &str, _certificate_pem: &str) -> anyhow::Result<()> {
            if self.fail_revoke.load(Ordering::SeqCst) {
                anyhow::bail!("authority unreachable");
            }
            self.revoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(authority: Arc<StubAuthority>) -> CertificateManager {
        let store = CertificateStore::new(Database::open_in_memory().unwrap());
        CertificateManager::new(store, authority, "public.localhost", 30)
    }

    #[tokio::test]
    async fn test_issue_stores_certificate() {
        let authority = Arc::new(StubAuthority::default());
        let manager = manager(authority.clone());

        let record = manager.issue("D1.example.com").await.unwrap();
        assert_eq!(record.domain, "d1.example.com");
        assert!(record.certificate.contains("BEGIN CERTIFICATE"));
        assert!(record.expires_at().is_some());
        let stored = manager.store().get("d1.example.com").await.unwrap().unwrap();
        assert_eq!(stored.certificate, record.certificate);
        assert_eq!(stored.private_key, record.private_key);

        manager.issue("d1.example.com").await.unwrap();
        assert_eq!(manager.store().list_domains().await.unwrap().len(), 1);
        assert_eq!(authority.issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_issue_leaves_store_untouched() {
        let authority = Arc::new(StubAuthority::default());
        let manager = manager(authority.clone());

        manager.issue("d1.example.com").await.unwrap();
        let before = manager.store().get("d1.example.com").await.unwrap().unwrap();

        authority.fail_issue.store(true, Ordering::SeqCst);
        let err = manager.issue("d1.example.com").await.unwrap_err();
        assert!(matches!(err, CertError::IssuanceFailed { .. }));

        let after = manager.store().get("d1.example.com").await.unwrap().unwrap();
        assert_eq!(before.certificate, after.certificate);

        assert!(manager.issue("d2.example.com").await.is_err());
        assert!(!manager.store().exists("d2.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_deletes_record() {
        let authority = Arc::new(StubAuthority::default());
        let manager = manager(authority.clone());

        manager.issue("d1.example.com").await.unwrap();
        assert!(manager.revoke("d1.example.com").await.unwrap());
        assert!(!manager.store().exists("d1.example.com").await.unwrap());
        assert_eq!(authority.revoked.load(Ordering::SeqCst), 1);

        // nothing stored, nothing to revoke
        assert!(!manager.revoke("d1.example.com").await.unwrap());
        assert_eq!(authority.revoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_revocation_still_deletes_locally() {
        let authority = Arc::new(StubAuthority::default());
        let manager = manager(authority.clone());

        manager.issue("d1.example.com").await.unwrap();
        authority.fail_revoke.store(true, Ordering::SeqCst);

        let err = manager.revoke("d1.example.com").await.unwrap_err();
        assert!(matches!(err, CertError::RevocationFailed { .. }));
        assert!(!manager.store().exists("d1.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_primary_certificate_is_idempotent() {
        let authority = Arc::new(StubAuthority::default());
        let manager = manager(authority.clone());

        assert!(manager.ensure_primary_certificate().await.unwrap());
        assert!(!manager.ensure_primary_certificate().await.unwrap());
        assert!(manager.store().exists("public.localhost").await.unwrap());
        assert_eq!(authority.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renew_due_skips_fresh_certificates() {
        let authority = Arc::new(StubAuthority::default());
        let manager = manager(authority.clone());

        manager.issue("d1.example.com").await.unwrap();
        assert_eq!(manager.renew_due().await.unwrap(), 0);
        assert_eq!(authority.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renew_due_replaces_unparseable_material() {
        let authority = Arc::new(StubAuthority::default());
        let manager = manager(authority.clone());

        manager
            .store()
            .put("d1.example.com", "bogus key", "bogus cert")
            .await
            .unwrap();
        assert_eq!(manager.renew_due().await.unwrap(), 1);

        let record = manager.store().get("d1.example.com").await.unwrap().unwrap();
        assert!(record.certificate.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_renewal_loop_stops_on_shutdown() {
        let manager = Arc::new(manager(Arc::new(StubAuthority::default())));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(manager.run_renewal(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
