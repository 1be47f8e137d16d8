//! Tenant accounts: routing config, owned nodes, active and failed sets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use super::node::Node;
use crate::error::CoreError;

pub const RETRIES_RANGE: RangeInclusive<u32> = 1..=10;
pub const FAIL_LIMIT_RANGE: RangeInclusive<u32> = 1..=10;
pub const HEALTH_EVERY_MIN: Duration = Duration::from_secs(5);
pub const HEALTH_EVERY_MAX: Duration = Duration::from_secs(300);

/// Per-account routing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Attempts per proxied request
    pub retries: u32,
    /// Consecutive failures before a node is marked failed
    pub fail_limit: u32,
    /// Probe interval for failed nodes; zero disables probing for this account
    #[serde(rename = "health_every_ms", with = "duration_ms")]
    pub health_every: Duration,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            fail_limit: 3,
            health_every: Duration::from_secs(30),
        }
    }
}

impl AccountConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !RETRIES_RANGE.contains(&self.retries) {
            return Err(CoreError::InvalidConfig(format!(
                "retries must be within {}..={}, got {}",
                RETRIES_RANGE.start(),
                RETRIES_RANGE.end(),
                self.retries
            )));
        }
        if !FAIL_LIMIT_RANGE.contains(&self.fail_limit) {
            return Err(CoreError::InvalidConfig(format!(
                "fail_limit must be within {}..={}, got {}",
                FAIL_LIMIT_RANGE.start(),
                FAIL_LIMIT_RANGE.end(),
                self.fail_limit
            )));
        }
        if !self.health_every.is_zero()
            && (self.health_every < HEALTH_EVERY_MIN || self.health_every > HEALTH_EVERY_MAX)
        {
            return Err(CoreError::InvalidConfig(format!(
                "health_every must be within {}s..={}s (or 0 to disable), got {}ms",
                HEALTH_EVERY_MIN.as_secs(),
                HEALTH_EVERY_MAX.as_secs(),
                self.health_every.as_millis()
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// A tenant and everything it owns
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub password: String,
    pub proxy_api_key: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: AccountConfig,
    pub active_id: Option<String>,
    nodes: HashMap<String, Arc<Node>>,
    failed_set: HashSet<String>,
}

impl Account {
    pub fn new(name: &str, password: &str, proxy_api_key: &str, is_admin: bool) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            password: password.to_string(),
            proxy_api_key: proxy_api_key.to_string(),
            is_admin,
            created_at: now,
            updated_at: now,
            config: AccountConfig::default(),
            active_id: None,
            nodes: HashMap::new(),
            failed_set: HashSet::new(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    /// Mutable access; clones the node only if a snapshot still shares it
    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id).map(Arc::make_mut)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn failed_set(&self) -> &HashSet<String> {
        &self.failed_set
    }

    /// Nodes in priority order (best first)
    pub fn sorted_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.priority_key().cmp(&b.priority_key()));
        nodes
    }

    pub fn active_node(&self) -> Option<&Arc<Node>> {
        self.active_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    /// Insert or replace a node, keeping `failed_set` in step with `node.failed`
    pub(crate) fn put_node(&mut self, node: Node) {
        let id = node.id.clone();
        let failed = node.failed;
        self.nodes.insert(id.clone(), Arc::new(node));
        self.set_failed_membership(&id, failed);
    }

    pub(crate) fn take_node(&mut self, id: &str) -> Option<Arc<Node>> {
        self.failed_set.remove(id);
        if self.active_id.as_deref() == Some(id) {
            self.active_id = None;
        }
        self.nodes.remove(id)
    }

    /// Flip a node's failed flag and its `failed_set` membership together
    pub(crate) fn set_failed(&mut self, id: &str, failed: bool) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        node.failed = failed;
        self.set_failed_membership(id, failed);
        true
    }

    fn set_failed_membership(&mut self, id: &str, failed: bool) {
        if failed {
            self.failed_set.insert(id.to_string());
        } else {
            self.failed_set.remove(id);
        }
    }

    /// Structurally shared read view; node data is not copied
    pub fn snapshot(&self) -> AccountSnapshot {
        let mut failed: Vec<String> = self.failed_set.iter().cloned().collect();
        failed.sort();
        AccountSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            is_admin: self.is_admin,
            config: self.config,
            active_id: self.active_id.clone(),
            failed,
            nodes: self.sorted_nodes(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only account view for list-style endpoints and dashboards
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub name: String,
    pub is_admin: bool,
    pub config: AccountConfig,
    pub active_id: Option<String>,
    pub failed: Vec<String>,
    pub nodes: Vec<Arc<Node>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn active_node(&self) -> Option<&Arc<Node>> {
        let id = self.active_id.as_deref()?;
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AccountConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_ranges() {
        let mut config = AccountConfig::default();
        config.retries = 0;
        assert!(config.validate().is_err());
        config.retries = 11;
        assert!(config.validate().is_err());
        config.retries = 10;
        config.fail_limit = 0;
        assert!(config.validate().is_err());
        config.fail_limit = 1;
        config.health_every = Duration::from_secs(4);
        assert!(config.validate().is_err());
        config.health_every = Duration::from_secs(301);
        assert!(config.validate().is_err());
        config.health_every = Duration::from_secs(300);
        assert!(config.validate().is_ok());
        config.health_every = Duration::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let config = AccountConfig::default();
        let json = serde_json::to_value(config).unwrap();
        assert_eq!(json["health_every_ms"], 30_000);
        let back: AccountConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_failed_set_tracks_flag() {
        let mut account = Account::new("t", "pw", "key", false);
        let node = Node::new(&account.id, "a", "http://a", None, 1).unwrap();
        let id = node.id.clone();
        account.put_node(node);
        assert!(account.failed_set().is_empty());

        assert!(account.set_failed(&id, true));
        assert!(account.failed_set().contains(&id));
        assert!(account.node(&id).unwrap().failed);

        assert!(account.set_failed(&id, false));
        assert!(account.failed_set().is_empty());
        assert!(!account.set_failed("missing", true));
    }

    #[test]
    fn test_snapshot_shares_nodes() {
        let mut account = Account::new("t", "pw", "key", false);
        let node = Node::new(&account.id, "a", "http://a", None, 1).unwrap();
        let id = node.id.clone();
        account.put_node(node);

        let snapshot = account.snapshot();
        assert!(Arc::ptr_eq(&snapshot.nodes[0], account.node(&id).unwrap()));

        // Mutating after a snapshot leaves the snapshot untouched
        account.node_mut(&id).unwrap().metrics.requests = 7;
        assert_eq!(snapshot.nodes[0].metrics.requests, 0);
        assert_eq!(account.node(&id).unwrap().metrics.requests, 7);
    }

    #[test]
    fn test_take_node_clears_active_and_failed() {
        let mut account = Account::new("t", "pw", "key", false);
        let mut node = Node::new(&account.id, "a", "http://a", None, 1).unwrap();
        node.failed = true;
        let id = node.id.clone();
        account.put_node(node);
        account.active_id = Some(id.clone());

        assert!(account.take_node(&id).is_some());
        assert!(account.active_id.is_none());
        assert!(account.failed_set().is_empty());
    }
}
