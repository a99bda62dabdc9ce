//! Certificate authorities
//!
//! Two ways to obtain a certificate for a custom domain:
//! - [`AcmeAuthority`] talks ACME directly and answers HTTP-01 challenges from memory
//! - [`CommandAuthority`] shells out to certbot with a webroot and reads the PEMs it leaves behind
//!
//! The ACME account key lives unencrypted in the cache directory. Keep that
//! directory readable by the service user only.

use crate::config::{AcmeConfig, Config, IssuerKind};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus, RevocationRequest,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::CertificateDer;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Freshly issued key and certificate chain, both PEM encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub private_key_pem: String,
    pub certificate_pem: String,
}

/// Something that can issue and revoke certificates for a single domain
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn issue(&self, domain: &str) -> anyhow::Result<IssuedCertificate>;

    /// Revoke a certificate previously issued for `domain`
    async fn revoke(&self, domain: &str, certificate_pem: &str) -> anyhow::Result<()>;
}

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Build the configured authority
pub fn authority_from_config(
    config: &Config,
    challenges: Http01Challenges,
) -> anyhow::Result<Arc<dyn CertificateAuthority>> {
    match config.acme.issuer {
        IssuerKind::Acme => Ok(Arc::new(AcmeAuthority::new(config.acme.clone(), challenges)?)),
        IssuerKind::Command => Ok(Arc::new(CommandAuthority::new(
            &config.acme,
            &config.server.webroot,
        )?)),
    }
}

/// Issues certificates through an ACME directory using HTTP-01
pub struct AcmeAuthority {
    config: AcmeConfig,
    cache_dir: PathBuf,
    challenges: Http01Challenges,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    pub fn new(config: AcmeConfig, challenges: Http01Challenges) -> anyhow::Result<Self> {
        let cache_dir = validate_cache_dir(&config.cache_dir)?;
        Ok(Self {
            config,
            cache_dir,
            challenges,
            account: OnceCell::new(),
        })
    }

    fn directory_url(&self) -> &str {
        match (&self.config.directory_url, self.config.staging) {
            (Some(url), _) => url.as_str(),
            (None, true) => LetsEncrypt::Staging.url(),
            (None, false) => LetsEncrypt::Production.url(),
        }
    }

    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    /// Load or create an ACME account
    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = tokio::fs::read_to_string(&account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(directory = self.directory_url(), "Creating new ACME account");
        let email = self
            .config
            .email
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ACME email is required for account creation"))?;

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            self.directory_url(),
            None,
        )
        .await?;

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        write_private(&account_path, &serde_json::to_string_pretty(&credentials)?)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    async fn complete_authorizations(
        &self,
        order: &mut instant_acme::Order,
        domain: &str,
    ) -> anyhow::Result<()> {
        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", domain))?;

            let key_auth = order.key_authorization(challenge);
            debug!(domain, token = %challenge.token, "Serving HTTP-01 challenge");
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string())
                .await;

            let result = self.wait_for_authorization(order, &challenge.url, domain).await;
            self.challenges.remove(&challenge.token).await;
            result?;
        }
        Ok(())
    }

    async fn wait_for_authorization(
        &self,
        order: &mut instant_acme::Order,
        challenge_url: &str,
        domain: &str,
    ) -> anyhow::Result<()> {
        order.set_challenge_ready(challenge_url).await?;

        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let current = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain));

            match current.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Authorization timeout for {}", domain);
                    }
                    debug!(domain, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {}", domain);
                }
                Some(status) => {
                    anyhow::bail!("Authorization for {} ended as {:?}", domain, status);
                }
                None => {
                    anyhow::bail!("Authorization not found for {}", domain);
                }
            }
        }
    }

    async fn wait_until_ready(order: &mut instant_acme::Order) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => anyhow::bail!("Order invalid"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Order timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }
    }

    async fn download_certificate(order: &mut instant_acme::Order) -> anyhow::Result<String> {
        let mut attempts = 0;
        loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    return order
                        .certificate()
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("Order valid but no certificate returned"));
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("Unexpected order status: {:?}", status),
            }
        }
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn issue(&self, domain: &str) -> anyhow::Result<IssuedCertificate> {
        let account = self.account().await?;
        info!(domain, "Requesting new certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        self.complete_authorizations(&mut order, domain).await?;
        Self::wait_until_ready(&mut order).await?;

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let certificate_pem = Self::download_certificate(&mut order).await?;
        info!(domain, "Certificate obtained successfully");

        Ok(IssuedCertificate {
            private_key_pem: private_key.serialize_pem(),
            certificate_pem,
        })
    }

    async fn revoke(&self, domain: &str, certificate_pem: &str) -> anyhow::Result<()> {
        let leaf = first_certificate(certificate_pem)
            .ok_or_else(|| anyhow::anyhow!("No certificate found in stored PEM for {}", domain))?;

        let account = self.account().await?;
        account
            .revoke(&RevocationRequest {
                certificate: &leaf,
                reason: None,
            })
            .await?;

        info!(domain, "Certificate revoked");
        Ok(())
    }
}

/// Issues certificates by running an external ACME client (certbot by default)
pub struct CommandAuthority {
    program: String,
    base_args: Vec<String>,
    email: Option<String>,
    webroot: String,
    live_dir: PathBuf,
}

impl CommandAuthority {
    pub fn new(config: &AcmeConfig, webroot: &str) -> anyhow::Result<Self> {
        let mut words = shell_words::split(&config.command)
            .map_err(|e| anyhow::anyhow!("Invalid issuer command '{}': {}", config.command, e))?;
        if words.is_empty() {
            anyhow::bail!("Issuer command cannot be empty");
        }
        let program = words.remove(0);

        Ok(Self {
            program,
            base_args: words,
            email: config.email.clone(),
            webroot: webroot.to_string(),
            live_dir: PathBuf::from(&config.live_dir),
        })
    }

    async fn run(&self, args: &[String]) -> anyhow::Result<()> {
        debug!(program = %self.program, args = ?args, "Running issuer command");

        let output = tokio::process::Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }

    async fn read_live(&self, domain: &str) -> anyhow::Result<IssuedCertificate> {
        let dir = self.live_dir.join(domain);
        let private_key_pem = tokio::fs::read_to_string(dir.join("privkey.pem"))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read key for {}: {}", domain, e))?;
        let certificate_pem = tokio::fs::read_to_string(dir.join("fullchain.pem"))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read certificate for {}: {}", domain, e))?;

        Ok(IssuedCertificate {
            private_key_pem,
            certificate_pem,
        })
    }
}

#[async_trait]
impl CertificateAuthority for CommandAuthority {
    async fn issue(&self, domain: &str) -> anyhow::Result<IssuedCertificate> {
        let mut args: Vec<String> = [
            "certonly",
            "--cert-name",
            domain,
            "--non-interactive",
            "--agree-tos",
            "--keep",
            "--webroot",
            "-w",
            self.webroot.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        match &self.email {
            Some(email) => args.extend(["--email".to_string(), email.clone()]),
            None => args.push("--register-unsafely-without-email".to_string()),
        }
        args.extend(["-d".to_string(), domain.to_string()]);

        self.run(&args).await?;
        let issued = self.read_live(domain).await?;
        info!(domain, "Certificate obtained from issuer command");
        Ok(issued)
    }

    async fn revoke(&self, domain: &str, _certificate_pem: &str) -> anyhow::Result<()> {
        self.run(&[
            "revoke".to_string(),
            "--cert-name".to_string(),
            domain.to_string(),
            "--non-interactive".to_string(),
        ])
        .await?;

        // The revocation stands even if the local cleanup fails
        if let Err(e) = self
            .run(&[
                "delete".to_string(),
                "--cert-name".to_string(),
                domain.to_string(),
                "--non-interactive".to_string(),
            ])
            .await
        {
            warn!(domain, error = %e, "Failed to delete local issuer files");
        }

        info!(domain, "Certificate revoked by issuer command");
        Ok(())
    }
}

fn first_certificate(pem: &str) -> Option<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .filter_map(|c| c.ok())
        .next()
}

/// Write a secret file readable only by its owner
fn write_private(path: &std::path::Path, contents: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, contents.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)?;
    }
    Ok(())
}

/// Validate and canonicalize the ACME cache directory path
fn validate_cache_dir(path: &str) -> anyhow::Result<PathBuf> {
    if path.contains("..") {
        anyhow::bail!("ACME cache directory path must not contain '..'");
    }

    let path_buf = PathBuf::from(path);

    if path_buf.exists() {
        let canonical = path_buf.canonicalize().map_err(|e| {
            anyhow::anyhow!("Failed to canonicalize ACME cache directory '{}': {}", path, e)
        })?;
        if !canonical.is_dir() {
            anyhow::bail!("ACME cache path '{}' exists but is not a directory", path);
        }
        return Ok(canonical);
    }

    Ok(path_buf)
}
