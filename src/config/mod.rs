mod loader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::registry::{AccountConfig, HealthCheckMethod};

pub use loader::load_config;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Proxy server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Persistent store
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// sqlx connection string, e.g. `sqlite://failover-proxy.db?mode=rwc`
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://failover-proxy.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Shared outbound HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Bound on the wait for response headers of a single attempt
    #[serde(default = "default_per_attempt_timeout")]
    pub per_attempt_timeout_seconds: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
    /// TLS configuration options
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS configuration for upstream connections
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Accept invalid certificates (self-signed, expired)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Path to custom CA certificate (PEM format)
    pub ca_cert_path: Option<String>,
    /// Path to client certificate for mTLS
    pub client_cert_path: Option<String>,
    /// Path to client private key for mTLS
    pub client_key_path: Option<String>,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_per_attempt_timeout() -> u64 {
    30
}

fn default_pool_max_idle() -> usize {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            per_attempt_timeout_seconds: default_per_attempt_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            tls: None,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.per_attempt_timeout_seconds)
    }
}

/// Delay strategy between retry attempts
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `step_ms * attempt`
    #[default]
    Linear,
    /// Full jitter over `base_ms * 2^(attempt-1)`, capped at `cap_ms`
    Exponential,
}

/// Retry transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    /// Statuses that trigger another attempt; anything else is handed to the client
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<u16>,
}

fn default_step_ms() -> u64 {
    150
}

fn default_base_ms() -> u64 {
    50
}

fn default_cap_ms() -> u64 {
    2000
}

fn default_retry_on() -> Vec<u16> {
    vec![502, 503, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::default(),
            step_ms: default_step_ms(),
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, status: u16) -> bool {
        self.retry_on.contains(&status)
    }
}

/// Health prober configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// Model named in the minimal `/v1/messages` probe
    #[serde(default = "default_probe_model")]
    pub probe_model: String,
    /// Sleep when every account has probing disabled
    #[serde(default = "default_idle_poll")]
    pub idle_poll_seconds: u64,
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_probe_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}

fn default_idle_poll() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_seconds: default_probe_timeout(),
            probe_model: default_probe_model(),
            idle_poll_seconds: default_idle_poll(),
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_seconds.max(1))
    }
}

/// Reverse proxy engine limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Response prefix kept for usage extraction
    #[serde(default = "default_capture_bytes")]
    pub capture_bytes: usize,
    /// Account id serving requests without a known proxy key
    #[serde(default)]
    pub fallback_account: Option<String>,
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_capture_bytes() -> usize {
    256 * 1024
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            capture_bytes: default_capture_bytes(),
            fallback_account: None,
        }
    }
}

/// Accounts created at startup
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub admin: AdminConfig,
    /// Seeded only when the store holds no accounts at all
    #[serde(default)]
    pub default_account: Option<DefaultAccountConfig>,
}

/// Admin account synthesized when no admin row exists
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_name")]
    pub name: String,
    #[serde(default = "default_admin_password")]
    pub password: String,
    /// Generated at startup when unset
    #[serde(default)]
    pub proxy_api_key: Option<String>,
}

fn default_admin_name() -> String {
    "admin".to_string()
}

fn default_admin_password() -> String {
    "admin".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            name: default_admin_name(),
            password: default_admin_password(),
            proxy_api_key: None,
        }
    }
}

/// Default tenant and its nodes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DefaultAccountConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_account_name")]
    pub name: String,
    #[serde(default)]
    pub password: String,
    pub proxy_api_key: String,
    /// Serve unauthenticated requests with this account
    #[serde(default = "default_fallback")]
    pub fallback: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_fail_limit")]
    pub fail_limit: u32,
    #[serde(default = "default_health_every")]
    pub health_every_seconds: u64,
    #[serde(default)]
    pub nodes: Vec<SeedNodeConfig>,
}

fn default_account_name() -> String {
    "default".to_string()
}

fn default_fallback() -> bool {
    true
}

fn default_retries() -> u32 {
    3
}

fn default_fail_limit() -> u32 {
    3
}

fn default_health_every() -> u64 {
    30
}

impl DefaultAccountConfig {
    pub fn account_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| "default".to_string())
    }

    pub fn account_config(&self) -> AccountConfig {
        AccountConfig {
            retries: self.retries,
            fail_limit: self.fail_limit,
            health_every: Duration::from_secs(self.health_every_seconds),
        }
    }
}

/// Node seeded into the default account
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeedNodeConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub health_check_method: HealthCheckMethod,
}

fn default_weight() -> u32 {
    1
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_config(path)
    }

    /// Minimal in-process configuration listening on `port`
    pub fn with_port(port: u16) -> Self {
        Self {
            server: ServerConfig {
                port,
                host: default_host(),
            },
            database: DatabaseConfig::default(),
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            proxy: ProxyConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }

    /// Account id that serves requests without a recognised proxy key
    pub fn fallback_account_id(&self) -> Option<String> {
        if let Some(id) = &self.proxy.fallback_account {
            return Some(id.clone());
        }
        let default = self.bootstrap.default_account.as_ref()?;
        if default.fallback {
            Some(default.account_id())
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port must not be 0".into()));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".into()));
        }
        if self.upstream.per_attempt_timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "upstream.per_attempt_timeout_seconds must be at least 1".into(),
            ));
        }
        if let Some(code) = self.retry.retry_on.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(ConfigError::Validation(format!(
                "retry.retry_on contains invalid status code {}",
                code
            )));
        }
        if self.retry.backoff == BackoffKind::Exponential {
            if !(10..=100).contains(&self.retry.base_ms) {
                return Err(ConfigError::Validation(format!(
                    "retry.base_ms must be within 10..=100 for exponential backoff, got {}",
                    self.retry.base_ms
                )));
            }
            if self.retry.cap_ms < self.retry.base_ms {
                return Err(ConfigError::Validation(
                    "retry.cap_ms must not be lower than retry.base_ms".into(),
                ));
            }
        }
        if self.proxy.max_body_bytes == 0 || self.proxy.capture_bytes == 0 {
            return Err(ConfigError::Validation(
                "proxy.max_body_bytes and proxy.capture_bytes must be positive".into(),
            ));
        }
        if self.health.probe_timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "health.probe_timeout_seconds must be at least 1".into(),
            ));
        }
        if let Some(key) = &self.bootstrap.admin.proxy_api_key {
            if key.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "bootstrap.admin.proxy_api_key must not be empty when set".into(),
                ));
            }
        }
        if let Some(default) = &self.bootstrap.default_account {
            if default.proxy_api_key.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "bootstrap.default_account.proxy_api_key must not be empty".into(),
                ));
            }
            default
                .account_config()
                .validate()
                .map_err(|e| ConfigError::Validation(format!("bootstrap.default_account: {}", e)))?;
            for node in &default.nodes {
                crate::registry::parse_node_url(&node.url).map_err(|e| {
                    ConfigError::Validation(format!("node '{}': {}", node.name, e))
                })?;
                crate::registry::validate_weight(node.weight).map_err(|e| {
                    ConfigError::Validation(format!("node '{}': {}", node.name, e))
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
