//! Integration tests for Tenantgate
//!
//! Each test binds the proxy on an ephemeral port, speaks raw HTTP/1.1 to it
//! and routes to an in-process echo backend on 127.0.0.1. The echo backend is
//! reached through the `http://{username}:{port}` template with the username
//! `127.0.0.1`.

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tenantgate::api::RegistrationApi;
use tenantgate::certs::CertificateStore;
use tenantgate::config::RoutingConfig;
use tenantgate::db::Database;
use tenantgate::error::full_body;
use tenantgate::forward::{ForwardConfig, Forwarder};
use tenantgate::identity::{encode_username, Authorizer, IdentityError, ResolvedIdentity};
use tenantgate::issuer::{CertificateAuthority, Http01Challenges, IssuedCertificate};
use tenantgate::lifecycle::CertificateManager;
use tenantgate::proxy::{ProxyServer, ProxyState};
use tenantgate::registry::DomainRegistry;
use tenantgate::routing::Router;
use tenantgate::tls::SniSelector;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

const PRIMARY_HOST: &str = "public.localhost";

/// Accepts `token good` as the loopback account
struct StaticAuthorizer;

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn verify_credential(&self, authorization: &str) -> Result<ResolvedIdentity, IdentityError> {
        if authorization == "token good" {
            Ok(ResolvedIdentity {
                email: "127.0.0.1".to_string(),
            })
        } else {
            Err(IdentityError::AuthenticationFailed("rejected".to_string()))
        }
    }
}

/// Self-signed issuance that counts its calls
#[derive(Default)]
struct CountingAuthority {
    issued: AtomicUsize,
    revoked: AtomicUsize,
}

#[async_trait]
impl CertificateAuthority for CountingAuthority {
    async fn issue(&self, domain: &str) -> anyhow::Result<IssuedCertificate> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![domain.to_string()])?;
        Ok(IssuedCertificate {
            private_key_pem: key_pair.serialize_pem(),
            certificate_pem: cert.pem(),
        })
    }

    async fn revoke(&self, _domain: &str, _certificate_pem: &str) -> anyhow::Result<()> {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend that answers with what it received
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let forwarded_host = req
                        .headers()
                        .get("x-forwarded-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body = format!("echo {} {} forwarded={}", req.method(), req.uri(), forwarded_host);
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("content-type", "text/plain")
                            .header("x-internal", "1")
                            .body(full_body(body))
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

struct TestGate {
    http_addr: SocketAddr,
    store: CertificateStore,
    registry: DomainRegistry,
    authority: Arc<CountingAuthority>,
    state: Arc<ProxyState>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestGate {
    async fn start() -> Self {
        let backend = spawn_echo_backend().await;
        Self::start_with_backend_port(backend.port()).await
    }

    async fn start_with_backend_port(backend_port: u16) -> Self {
        let db = Database::open_in_memory().unwrap();
        let registry = DomainRegistry::new(db.clone());
        let store = CertificateStore::new(db);
        let authority = Arc::new(CountingAuthority::default());
        let certificates = Arc::new(CertificateManager::new(
            store.clone(),
            authority.clone(),
            PRIMARY_HOST,
            30,
        ));

        let routing = RoutingConfig {
            primary_host: PRIMARY_HOST.to_string(),
            backend_prefix: "http://".to_string(),
            backend_suffix: String::new(),
            backend_port,
        };

        let state = Arc::new(ProxyState {
            router: Router::new(routing, registry.clone()),
            api: RegistrationApi::new(registry.clone(), certificates, Arc::new(StaticAuthorizer)),
            forwarder: Forwarder::new(ForwardConfig::default()),
            challenges: Http01Challenges::new(),
            webroot: None,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = listener.local_addr().unwrap();
        let server = ProxyServer::new(http_addr, Arc::clone(&state), shutdown_rx);
        tokio::spawn(server.serve(listener));

        Self {
            http_addr,
            store,
            registry,
            authority,
            state,
            shutdown_tx,
        }
    }

    async fn start_tls(&self, selector: SniSelector) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server =
            ProxyServer::new(addr, Arc::clone(&self.state), self.shutdown_tx.subscribe()).with_tls(selector);
        assert!(server.tls_enabled());
        tokio::spawn(server.serve(listener));
        addr
    }

    async fn request(&self, method: &str, host: &str, path: &str, extra: &[(&str, &str)], body: &str) -> (u16, String) {
        let stream = TcpStream::connect(self.http_addr).await.unwrap();
        send_raw(stream, method, host, path, extra, body).await
    }
}

impl Drop for TestGate {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Send one HTTP/1.1 request and return (status, full response text)
async fn send_raw<S>(
    mut stream: S,
    method: &str,
    host: &str,
    path: &str,
    extra: &[(&str, &str)],
    body: &str,
) -> (u16, String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        host,
        body.len()
    );
    for (name, value) in extra {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);

    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response).to_string();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (status, response)
}

#[tokio::test]
async fn test_primary_host_root_is_health() {
    let gate = TestGate::start().await;
    let (status, response) = gate.request("GET", PRIMARY_HOST, "/", &[], "").await;
    assert_eq!(status, 200);
    assert!(response.contains(r#"{"status":"ok"}"#));
    assert!(response.to_lowercase().contains("x-request-id:"));
}

#[tokio::test]
async fn test_direct_mode_proxies_to_user_backend() {
    let gate = TestGate::start().await;
    let path = format!("/{}/api/tok123?x=1", encode_username("127.0.0.1"));

    let (status, response) = gate.request("GET", PRIMARY_HOST, &path, &[], "").await;
    assert_eq!(status, 200);
    assert!(response.contains("echo GET /api/tok123?x=1 forwarded=public.localhost"));
    assert!(response.to_lowercase().contains("content-type: text/plain"));
    assert!(!response.to_lowercase().contains("x-internal"));
}

#[tokio::test]
async fn test_direct_mode_rejects_bad_input() {
    let gate = TestGate::start().await;

    let (status, _) = gate.request("GET", PRIMARY_HOST, "/!!!", &[], "").await;
    assert_eq!(status, 400);

    let path = format!("/{}/api", encode_username("127.0.0.1"));
    let (status, _) = gate.request("PUT", PRIMARY_HOST, &path, &[], "").await;
    assert_eq!(status, 405);
}

#[tokio::test]
async fn test_unreachable_backend_is_proxy_client_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let gate = TestGate::start_with_backend_port(dead_port).await;
    let (status, response) = gate
        .request("GET", PRIMARY_HOST, &format!("/{}", encode_username("127.0.0.1")), &[], "")
        .await;
    assert_eq!(status, 424);
    assert!(response.to_lowercase().contains("x-proxy-error: backend_unreachable"));
    assert!(response.contains("BACKEND_UNREACHABLE"));
}

#[tokio::test]
async fn test_unregistered_domain_is_not_found() {
    let gate = TestGate::start().await;
    let (status, response) = gate.request("GET", "unregistered.example.com", "/", &[], "").await;
    assert_eq!(status, 404);
    assert!(response.contains("DOMAIN_NOT_FOUND"));
}

#[tokio::test]
async fn test_registration_routes_domain_and_issues_certificate() {
    let gate = TestGate::start().await;
    let auth = [("Authorization", "token good"), ("Content-Type", "application/json")];

    let (status, response) = gate
        .request(
            "POST",
            PRIMARY_HOST,
            "/proxy",
            &auth,
            r#"{"domain":"App.Example.com","token":"tok","endPointType":"lab"}"#,
        )
        .await;
    assert_eq!(status, 200, "{}", response);
    assert!(response.contains(r#""certificateIssued":true"#));
    assert!(gate.store.exists("app.example.com").await.unwrap());
    assert_eq!(gate.authority.issued.load(Ordering::SeqCst), 1);

    // Stored endpoint type and token fill in the path
    let (status, response) = gate.request("GET", "app.example.com", "/", &[], "").await;
    assert_eq!(status, 200);
    assert!(response.contains("echo GET /lab/tok/ forwarded=app.example.com"));

    let (status, response) = gate.request("GET", PRIMARY_HOST, "/runner", &auth, "").await;
    assert_eq!(status, 200);
    assert!(response.contains("app.example.com"));

    let (status, response) = gate
        .request("DELETE", PRIMARY_HOST, "/proxy", &auth, r#"{"domain":"app.example.com","token":"tok","endpointType":"lab"}"#)
        .await;
    assert_eq!(status, 200, "{}", response);
    assert!(response.contains(r#""deleted":1"#));
    assert!(!gate.store.exists("app.example.com").await.unwrap());
    assert_eq!(gate.authority.revoked.load(Ordering::SeqCst), 1);
    assert!(gate.registry.list_bindings("127.0.0.1").await.unwrap().is_empty());

    let (status, _) = gate.request("GET", "app.example.com", "/", &[], "").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_registration_requires_credentials() {
    let gate = TestGate::start().await;

    let (status, _) = gate.request("GET", PRIMARY_HOST, "/proxy", &[], "").await;
    assert_eq!(status, 401);

    let (status, _) = gate
        .request("GET", PRIMARY_HOST, "/proxy", &[("Authorization", "token bad")], "")
        .await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_runner_route_requires_credentials() {
    let gate = TestGate::start().await;
    let path = format!("/runner/{}/api/tok", encode_username("127.0.0.1"));

    let (status, _) = gate.request("POST", PRIMARY_HOST, &path, &[], "").await;
    assert_eq!(status, 401);

    let (status, response) = gate
        .request("POST", PRIMARY_HOST, &path, &[("Authorization", "token good")], "hi")
        .await;
    assert_eq!(status, 200);
    assert!(response.contains("echo POST /api/tok/"));

    let (status, _) = gate
        .request("GET", PRIMARY_HOST, "/runner/a/b", &[("Authorization", "token good")], "")
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_acme_challenge_is_served() {
    let gate = TestGate::start().await;
    gate.state
        .challenges
        .set("tok-1".to_string(), "tok-1.thumbprint".to_string())
        .await;

    let (status, response) = gate
        .request("GET", "app.example.com", "/.well-known/acme-challenge/tok-1", &[], "")
        .await;
    assert_eq!(status, 200);
    assert!(response.ends_with("tok-1.thumbprint"));
}

#[tokio::test]
async fn test_https_listener_selects_certificate_by_sni() {
    let gate = TestGate::start().await;

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let leaf = CertificateParams::new(vec!["secure.example.com".to_string()])
        .unwrap()
        .signed_by(&leaf_key, &ca, &ca_key)
        .unwrap();
    gate.store
        .put("secure.example.com", &leaf_key.serialize_pem(), &leaf.pem())
        .await
        .unwrap();

    let addr = gate.start_tls(SniSelector::new(gate.store.clone())).await;

    let mut roots = RootCertStore::empty();
    roots.add(ca.der().clone()).unwrap();
    let client_config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from("secure.example.com").unwrap(), tcp)
        .await
        .unwrap();
    let (status, response) = send_raw(tls, "GET", PRIMARY_HOST, "/", &[], "").await;
    assert_eq!(status, 200);
    assert!(response.contains(r#"{"status":"ok"}"#));

    // No certificate stored for this name, so the handshake is refused
    let tcp = TcpStream::connect(addr).await.unwrap();
    let refused = connector
        .connect(ServerName::try_from("other.example.com").unwrap(), tcp)
        .await;
    assert!(refused.is_err());
}
