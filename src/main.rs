use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::api::RegistrationApi;
use tenantgate::certs::CertificateStore;
use tenantgate::config::Config;
use tenantgate::db::Database;
use tenantgate::forward::{ForwardConfig, Forwarder};
use tenantgate::identity::HubAuthorizer;
use tenantgate::issuer::{authority_from_config, Http01Challenges};
use tenantgate::lifecycle::CertificateManager;
use tenantgate::proxy::{ProxyServer, ProxyState};
use tenantgate::registry::DomainRegistry;
use tenantgate::routing::Router;
use tenantgate::tls::SniSelector;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse()?),
        )
        .init();

    // Load configuration (file, then PROXY_HOST / SINGLEUSER_* / HUB_* style environment overrides)
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tenantgate.toml"));

    let config = Config::from_sources(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let db = Database::open_location(&config.database.location()?)?;
    let registry = DomainRegistry::new(db.clone());
    let store = CertificateStore::new(db);
    let challenges = Http01Challenges::new();

    let authority = authority_from_config(&config, challenges.clone())?;
    let certificates = Arc::new(CertificateManager::new(
        store.clone(),
        authority,
        config.routing.primary_host.clone(),
        config.acme.renew_before_days,
    ));

    let authorizer = Arc::new(HubAuthorizer::new(&config.auth)?);
    info!(endpoint = %authorizer.endpoint(), "Hub authorizer configured");

    let forward_config = ForwardConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        request_timeout: config.server.request_timeout(),
    };
    info!(
        max_idle = forward_config.max_idle_per_host,
        idle_timeout_secs = forward_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );

    let state = Arc::new(ProxyState {
        router: Router::new(config.routing.clone(), registry.clone()),
        api: RegistrationApi::new(registry, Arc::clone(&certificates), authorizer),
        forwarder: Forwarder::new(forward_config),
        challenges,
        webroot: config.server.tls.then(|| PathBuf::from(&config.server.webroot)),
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_addr = bind_addr(&config.server.bind, config.server.port)?;
    let http_proxy = ProxyServer::new(http_addr, Arc::clone(&state), shutdown_rx.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_proxy.run().await {
            error!(error = %e, "HTTP proxy server error");
        }
    });

    let https_port = config.server.https_port();
    let https_handle = if https_port > 0 {
        let https_addr = bind_addr(&config.server.bind, https_port)?;
        let selector = SniSelector::new(store).with_fallback_name(config.routing.primary_host.clone());
        let https_proxy = ProxyServer::new(https_addr, Arc::clone(&state), shutdown_rx.clone()).with_tls(selector);

        Some(tokio::spawn(async move {
            if let Err(e) = https_proxy.run().await {
                error!(error = %e, "HTTPS proxy server error");
            }
        }))
    } else {
        None
    };

    let renewal_handle = if config.server.tls {
        if config.server.issue_primary_cert {
            let manager = Arc::clone(&certificates);
            tokio::spawn(async move {
                match manager.ensure_primary_certificate().await {
                    Ok(true) => info!("Primary host certificate issued"),
                    Ok(false) => info!("Primary host certificate already present"),
                    Err(e) => error!(error = %e, "Failed to issue primary host certificate"),
                }
            });
        }
        Some(tokio::spawn(Arc::clone(&certificates).run_renewal(shutdown_rx.clone())))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        if let Some(handle) = renewal_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!("{} v{}", PKG_NAME, VERSION);
    let backend = format!(
        "{}{{user}}{}:{}",
        config.routing.backend_prefix, config.routing.backend_suffix, config.routing.backend_port
    );
    info!(primary_host = %config.routing.primary_host, backend = %backend, "Routing");
    info!(port = config.server.port, "HTTP listener");
    if config.server.tls {
        info!(
            port = config.server.tls_port,
            issuer = ?config.acme.issuer,
            renew_before_days = config.acme.renew_before_days,
            "HTTPS listener with per-domain certificates"
        );
    }
}
