use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How backend URLs are built
    #[serde(default)]
    pub routing: RoutingConfig,

    /// External authorization service
    #[serde(default)]
    pub auth: AuthConfig,

    /// Certificate issuance settings
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Persistent store
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 3002)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port used when TLS termination is enabled (default: 443)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Enable TLS termination with per-domain certificates
    #[serde(default)]
    pub tls: bool,

    /// Issue a certificate for the primary proxy host at startup
    #[serde(default)]
    pub issue_primary_cert: bool,

    /// Directory served under /.well-known/ when TLS is enabled
    #[serde(default = "default_webroot")]
    pub webroot: String,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Time allowed for the backend to produce response headers (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls {
            return 0;
        }
        self.tls_port
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: default_tls_port(),
            bind: default_bind_address(),
            tls: false,
            issue_primary_cert: false,
            webroot: default_webroot(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Backend URL template: `{backend_prefix}{username}{backend_suffix}:{backend_port}`
#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// The proxy's own canonical hostname
    #[serde(default = "default_primary_host")]
    pub primary_host: String,

    /// Scheme and hostname prefix placed before the username
    #[serde(default = "default_backend_prefix")]
    pub backend_prefix: String,

    /// Hostname suffix placed after the username
    #[serde(default = "default_backend_suffix")]
    pub backend_suffix: String,

    /// Port every single-user backend listens on
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            primary_host: default_primary_host(),
            backend_prefix: default_backend_prefix(),
            backend_suffix: default_backend_suffix(),
            backend_port: default_backend_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Host of the service that validates bearer credentials
    #[serde(default = "default_hub_host")]
    pub hub_host: String,

    /// Scheme used to reach the hub (default: https)
    #[serde(default = "default_hub_scheme")]
    pub hub_scheme: String,

    /// Timeout for a single authorization call in seconds
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

impl AuthConfig {
    /// URL answering `{"name": ...}` for a valid credential
    pub fn user_endpoint(&self) -> String {
        format!("{}://{}/hub/api/user", self.hub_scheme, self.hub_host)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            hub_host: default_hub_host(),
            hub_scheme: default_hub_scheme(),
            timeout_secs: default_auth_timeout(),
        }
    }
}

/// Which certificate authority implementation to use
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssuerKind {
    /// Talk ACME directly
    #[default]
    Acme,
    /// Shell out to a certbot-style tool
    Command,
}

impl std::str::FromStr for IssuerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acme" => Ok(IssuerKind::Acme),
            "command" | "certbot" => Ok(IssuerKind::Command),
            other => anyhow::bail!("unknown certificate issuer '{}'", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Certificate authority implementation
    #[serde(default)]
    pub issuer: IssuerKind,

    /// Contact email registered with the certificate authority
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production, or staging when `staging` is set)
    pub directory_url: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[serde(default)]
    pub staging: bool,

    /// Local directory for the ACME account credentials
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,

    /// Command prefix for the `command` issuer
    #[serde(default = "default_certbot_command")]
    pub command: String,

    /// Directory where the command issuer leaves `{domain}/privkey.pem` and `{domain}/fullchain.pem`
    #[serde(default = "default_live_dir")]
    pub live_dir: String,

    /// Renew certificates expiring within this many days
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            issuer: IssuerKind::default(),
            email: None,
            directory_url: None,
            staging: false,
            cache_dir: default_acme_cache_dir(),
            command: default_certbot_command(),
            live_dir: default_live_dir(),
            renew_before_days: default_renew_before_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Connection string: `sqlite://path`, a bare file path, or `:memory:`
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// Where the persistent store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(String),
}

impl DatabaseConfig {
    pub fn location(&self) -> anyhow::Result<StoreLocation> {
        let url = self.url.trim();
        if url.is_empty() {
            anyhow::bail!("database url must not be empty");
        }
        if url == ":memory:" || url == "sqlite::memory:" {
            return Ok(StoreLocation::Memory);
        }
        if let Some(path) = url.strip_prefix("sqlite://") {
            return Ok(StoreLocation::File(path.to_string()));
        }
        if let Some(path) = url.strip_prefix("sqlite:") {
            return Ok(StoreLocation::File(path.to_string()));
        }
        if let Some((scheme, _)) = url.split_once("://") {
            anyhow::bail!("unsupported database scheme '{}'", scheme);
        }
        Ok(StoreLocation::File(url.to_string()))
    }
}

fn default_listen_port() -> u16 {
    3002
}

fn default_tls_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_webroot() -> String {
    "./webroot".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    300
}

fn default_primary_host() -> String {
    "public.localhost".to_string()
}

fn default_backend_prefix() -> String {
    "http://jupyter-".to_string()
}

fn default_backend_suffix() -> String {
    ".jupyter-single-user.svc.cluster.local".to_string()
}

fn default_backend_port() -> u16 {
    5000
}

fn default_hub_host() -> String {
    "hub.localhost".to_string()
}

fn default_hub_scheme() -> String {
    "https".to_string()
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

fn default_certbot_command() -> String {
    "certbot --config-dir ./certbot/etc --work-dir ./certbot/var --logs-dir ./certbot/log".to_string()
}

fn default_live_dir() -> String {
    "./certbot/etc/live".to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_database_url() -> String {
    "database.sqlite".to_string()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, then apply environment overrides and validate
    pub fn from_sources<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override file values with environment variables
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // NAAS_* names are what older deployments set; the plain names win
        let lookup_or = |name: &str, alias: &str| lookup(name).or_else(|| lookup(alias));

        if let Some(v) = lookup_or("PROXY_HOST", "NAAS_PROXY_HOST") {
            self.routing.primary_host = v;
        }
        if let Some(v) = lookup("SINGLEUSER_BASE") {
            self.routing.backend_prefix = v;
        }
        if let Some(v) = lookup("SINGLEUSER_PATH") {
            self.routing.backend_suffix = v;
        }
        if let Some(v) = lookup_or("SINGLEUSER_PORT", "NAAS_PORT") {
            self.routing.backend_port = v
                .parse()
                .map_err(|e| anyhow::anyhow!("SINGLEUSER_PORT: {}", e))?;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = v.parse().map_err(|e| anyhow::anyhow!("PORT: {}", e))?;
        }
        if let Some(v) = lookup("TLS_PORT") {
            self.server.tls_port = v.parse().map_err(|e| anyhow::anyhow!("TLS_PORT: {}", e))?;
        }
        if let Some(v) = lookup("SSL") {
            self.server.tls = parse_flag(&v);
        }
        if let Some(v) = lookup("MAIN_SSL") {
            self.server.issue_primary_cert = parse_flag(&v);
        }
        if let Some(v) = lookup("WEBROOT") {
            self.server.webroot = v;
        }
        if let Some(v) = lookup("HUB_HOST") {
            self.auth.hub_host = v;
        }
        if let Some(v) = lookup("HUB_SCHEME") {
            self.auth.hub_scheme = v;
        }
        if let Some(v) = lookup_or("MAINTAINER_EMAIL", "NAAS_MAINTAINER") {
            self.acme.email = Some(v);
        }
        if let Some(v) = lookup("ACME_DIRECTORY_URL") {
            self.acme.directory_url = Some(v);
        }
        if let Some(v) = lookup("ACME_STAGING") {
            self.acme.staging = parse_flag(&v);
        }
        if let Some(v) = lookup("CERT_ISSUER") {
            self.acme.issuer = v.parse()?;
        }
        if let Some(v) = lookup("HUB_DB") {
            self.database.url = v;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.routing.primary_host.trim().is_empty() {
            errors.push("routing.primary_host must not be empty".to_string());
        }
        if self.routing.backend_port == 0 {
            errors.push("routing.backend_port must be greater than 0".to_string());
        }
        if self.server.tls && self.server.tls_port == 0 {
            errors.push("server.tls_port must be greater than 0 when TLS is enabled".to_string());
        }
        if self.server.tls && self.acme.issuer == IssuerKind::Acme && self.acme.email.is_none() {
            errors.push("acme.email is required when TLS is enabled with the ACME issuer".to_string());
        }
        if let Err(e) = self.database.location() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
