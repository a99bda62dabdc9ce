//! Handshake-time certificate selection
//!
//! Every TLS connection starts with a lazy accept: read the ClientHello, look
//! the requested server name up in the certificate store, then finish the
//! handshake with a config built from that record. No record means no
//! handshake. Issuance never happens here.

use crate::certs::{CertError, CertificateStore};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

/// Picks the server config for each handshake from the certificate store
#[derive(Clone)]
pub struct SniSelector {
    store: CertificateStore,
    fallback_name: Option<String>,
}

impl SniSelector {
    pub fn new(store: CertificateStore) -> Self {
        Self {
            store,
            fallback_name: None,
        }
    }

    /// Name to use for clients that send no SNI (typically the primary host)
    pub fn with_fallback_name(mut self, name: impl Into<String>) -> Self {
        self.fallback_name = Some(name.into());
        self
    }

    /// Build the secure context for `server_name`, failing when nothing is stored for it
    pub async fn select_context(&self, server_name: Option<&str>) -> Result<Arc<ServerConfig>, CertError> {
        let name = match server_name.or(self.fallback_name.as_deref()) {
            Some(name) => name.trim_end_matches('.').to_ascii_lowercase(),
            None => return Err(CertError::NoCertificateForDomain(String::new())),
        };

        let record = self
            .store
            .get(&name)
            .await?
            .ok_or_else(|| CertError::NoCertificateForDomain(name.clone()))?;

        server_config_from_pem(&name, &record.certificate, &record.private_key)
    }

    /// Run the handshake on `stream` with the certificate for its SNI name
    pub async fn accept<IO>(&self, stream: IO) -> anyhow::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read ClientHello: {}", e))?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        let config = match self.select_context(server_name.as_deref()).await {
            Ok(config) => config,
            Err(e) => {
                debug!(server_name = ?server_name, error = %e, "Refusing TLS handshake");
                return Err(e.into());
            }
        };

        let stream = start
            .into_stream(config)
            .await
            .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;
        Ok(stream)
    }
}

/// Build a rustls server config from a PEM certificate chain and private key
pub fn server_config_from_pem(
    domain: &str,
    certificate_pem: &str,
    private_key_pem: &str,
) -> Result<Arc<ServerConfig>, CertError> {
    let invalid = |reason: String| CertError::InvalidMaterial {
        domain: domain.to_string(),
        reason,
    };

    let certs = parse_certs(certificate_pem).map_err(invalid)?;
    let key = parse_key(private_key_pem).map_err(invalid)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| invalid(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            warn!(domain, error = %e, "Stored certificate does not match its key");
            invalid(e.to_string())
        })?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        return Err("no certificates found".to_string());
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, String> {
    let mut reader = BufReader::new(pem.as_bytes());

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|e| format!("failed to parse key: {}", e))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err("no private key found".to_string())
}
