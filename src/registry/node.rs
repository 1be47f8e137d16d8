//! Upstream node model and its counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

/// How the health prober checks a failed node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMethod {
    /// POST /v1/messages when the node has an api key, HEAD / otherwise
    #[default]
    Auto,
    Messages,
    Head,
}

/// Concrete probe the prober sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Messages,
    Head,
}

impl HealthCheckMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckMethod::Auto => "auto",
            HealthCheckMethod::Messages => "messages",
            HealthCheckMethod::Head => "head",
        }
    }

    /// Parse the stored column value, unknown values fall back to `Auto`
    pub fn from_column(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "messages" | "post" => HealthCheckMethod::Messages,
            "head" => HealthCheckMethod::Head,
            _ => HealthCheckMethod::Auto,
        }
    }

    pub fn resolve(&self, has_api_key: bool) -> ProbeKind {
        match self {
            HealthCheckMethod::Auto if has_api_key => ProbeKind::Messages,
            HealthCheckMethod::Auto => ProbeKind::Head,
            HealthCheckMethod::Messages => ProbeKind::Messages,
            HealthCheckMethod::Head => ProbeKind::Head,
        }
    }
}

/// Per-node traffic and health counters
///
/// `requests`, `fail_count` and the totals only ever grow. `fail_streak`
/// drops back to zero on the first 200 response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeMetrics {
    pub requests: u64,
    pub fail_count: u64,
    pub fail_streak: u64,
    pub first_byte_ms_total: u64,
    pub stream_ms_total: u64,
    pub total_bytes: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub last_ping_ms: Option<u64>,
    pub last_ping_err: String,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl NodeMetrics {
    /// Average time to first byte over all requests that produced a body
    pub fn avg_first_byte_ms(&self) -> Option<f64> {
        if self.requests == 0 || self.first_byte_ms_total == 0 {
            return None;
        }
        Some(self.first_byte_ms_total as f64 / self.requests as f64)
    }
}

/// One upstream endpoint owned by an account
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub url: Url,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    /// Lower weight wins
    pub weight: u32,
    pub health_check_method: HealthCheckMethod,
    pub failed: bool,
    pub disabled: bool,
    pub last_error: String,
    pub metrics: NodeMetrics,
}

impl Node {
    /// Build a fresh node with a generated id and zeroed counters
    pub fn new(
        account_id: &str,
        name: &str,
        url: &str,
        api_key: Option<String>,
        weight: u32,
    ) -> Result<Self, CoreError> {
        validate_weight(weight)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            url: parse_node_url(url)?,
            api_key: normalize_api_key(api_key),
            account_id: account_id.to_string(),
            created_at: Utc::now(),
            weight,
            health_check_method: HealthCheckMethod::Auto,
            failed: false,
            disabled: false,
            last_error: String::new(),
            metrics: NodeMetrics::default(),
        })
    }

    /// Returns the base URL with trailing slash stripped
    pub fn base_url(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }

    /// Full upstream URL for an inbound path (and optional query)
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) => format!("{}{}?{}", self.base_url(), path, q),
            None => format!("{}{}", self.base_url(), path),
        }
    }

    /// `host[:port]` for the outbound Host header
    pub fn host_header(&self) -> Option<String> {
        let host = self.url.host_str()?;
        Some(match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    pub fn is_healthy(&self) -> bool {
        !self.failed && !self.disabled
    }

    /// Sort key for strict priority: weight, then age, then id
    pub fn priority_key(&self) -> (u32, DateTime<Utc>, &str) {
        (self.weight, self.created_at, self.id.as_str())
    }

    pub fn outranks(&self, other: &Node) -> bool {
        self.priority_key() < other.priority_key()
    }
}

/// Parse and validate an upstream base URL
pub fn parse_node_url(raw: &str) -> Result<Url, CoreError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| CoreError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::InvalidUrl {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(CoreError::InvalidUrl {
            url: trimmed.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

pub fn validate_weight(weight: u32) -> Result<(), CoreError> {
    if weight == 0 {
        return Err(CoreError::InvalidConfig(
            "weight must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Empty keys are treated as "no key"
pub fn normalize_api_key(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}
