//! Control plane over the shared registry
//!
//! Every mutation of accounts and nodes goes through [`ControlPlane`]: it
//! takes the registry write lock, applies the change, lets the selector react,
//! and queues the affected rows on the [`Mirror`]. Queuing is a non-blocking
//! channel push, so the lock is never held across I/O and the store sees
//! writes in lock order.
//!
//! The reverse proxy and the health prober report outcomes here as well
//! ([`ControlPlane::record_outcome`], [`ControlPlane::recover_node`]).

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use url::Url;

use crate::error::CoreError;
use crate::registry::{
    normalize_api_key, parse_node_url, selector, validate_weight, Account, AccountConfig,
    AccountSnapshot, HealthCheckMethod, Node, Registry,
};
use crate::store::{AccountRecord, ConfigRecord, Mirror};

/// Fields of a node to create
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
    pub weight: u32,
    pub health_check_method: HealthCheckMethod,
}

impl NodeSpec {
    pub fn new(name: &str, url: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            api_key: None,
            weight,
            health_check_method: HealthCheckMethod::Auto,
        }
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }
}

/// Partial node edit; `None` leaves a field as is
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    /// `Some(None)` removes the key
    pub api_key: Option<Option<String>>,
    pub weight: Option<u32>,
    pub health_check_method: Option<HealthCheckMethod>,
}

/// Partial routing config edit
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigUpdate {
    pub retries: Option<u32>,
    pub fail_limit: Option<u32>,
    pub health_every: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Option<String>,
    pub name: String,
    pub password: String,
    pub proxy_api_key: String,
    pub is_admin: bool,
    pub config: AccountConfig,
}

impl NewAccount {
    pub fn new(name: &str, proxy_api_key: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            password: String::new(),
            proxy_api_key: proxy_api_key.to_string(),
            is_admin: false,
            config: AccountConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub name: Option<String>,
    pub password: Option<String>,
    pub proxy_api_key: Option<String>,
    pub is_admin: Option<bool>,
}

/// Where a proxied request goes
#[derive(Debug, Clone)]
pub struct Route {
    pub account_id: String,
    pub retries: u32,
    pub node: Arc<Node>,
}

/// What the reverse proxy observed for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOutcome {
    /// Status seen by the client
    pub status: u16,
    /// `X-Retry-Error` of a synthesized response
    pub retry_error: Option<String>,
    pub bytes: u64,
    pub first_byte: Option<Duration>,
    pub stream: Option<Duration>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RequestOutcome {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Effect of a recorded outcome on the node and its account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeEffect {
    /// The node crossed its fail limit on this outcome
    pub tripped: bool,
    /// A failed node was re-admitted by this outcome
    pub recovered: bool,
    pub active_changed: bool,
}

/// A failed node to health-check, copied out of the registry
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub account_id: String,
    pub node_id: String,
    pub name: String,
    pub url: Url,
    pub api_key: Option<String>,
    pub method: HealthCheckMethod,
}

/// Nodes/account counts for dashboards
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub accounts: usize,
    pub nodes: usize,
    pub failed: usize,
    pub disabled: usize,
}

#[derive(Clone)]
pub struct ControlPlane {
    registry: Arc<RwLock<Registry>>,
    mirror: Mirror,
}

impl ControlPlane {
    pub fn new(registry: Registry, mirror: Mirror) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            mirror,
        }
    }

    /// In-memory only, nothing is persisted
    pub fn ephemeral() -> Self {
        Self::new(Registry::new(), Mirror::disabled())
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the registry under the read lock
    pub fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        f(&self.read())
    }

    fn persist_config(&self, account: &Account) {
        self.mirror
            .config_saved(&account.id, ConfigRecord::from(account));
    }

    /// Queue the current routing config row of an account
    pub fn persist_active(&self, account_id: &str) {
        let registry = self.read();
        if let Some(account) = registry.get_account(account_id) {
            tracing::info!(account = %account.id, active = ?account.active_id, "Persisting active node");
            self.persist_config(account);
        }
    }

    // ----- routing -----

    /// Account id for a proxy key
    pub fn resolve_by_proxy_key(&self, key: &str) -> Option<String> {
        self.read().resolve_by_proxy_key(key).map(|a| a.id.clone())
    }

    pub fn account_exists(&self, account_id: &str) -> bool {
        self.read().get_account(account_id).is_some()
    }

    /// Node that should serve the next request of `account_id`.
    ///
    /// Takes the read lock when the current active node is usable and only
    /// upgrades to the write lock when the selector has to run.
    pub fn active_target(&self, account_id: &str) -> Result<Route, CoreError> {
        {
            let registry = self.read();
            let account = registry
                .get_account(account_id)
                .ok_or_else(|| CoreError::account_not_found(account_id))?;
            if let Some(node) = selector::usable_active(account) {
                return Ok(Route {
                    account_id: account.id.clone(),
                    retries: account.config.retries,
                    node: node.clone(),
                });
            }
        }

        let mut registry = self.write();
        let account = registry
            .get_account_mut(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))?;
        let before = account.active_id.clone();
        let node = selector::get_active(account)?;
        if account.active_id != before {
            self.persist_config(account);
        }
        Ok(Route {
            account_id: account.id.clone(),
            retries: account.config.retries,
            node,
        })
    }

    /// Post-response bookkeeping and failure handling for one proxied request
    pub fn record_outcome(&self, node_id: &str, outcome: &RequestOutcome) -> OutcomeEffect {
        let mut registry = self.write();
        let Some(account) = registry.get_account_of_mut(node_id) else {
            tracing::debug!(node_id, "Outcome for a node that no longer exists");
            return OutcomeEffect::default();
        };
        let fail_limit = u64::from(account.config.fail_limit);
        let before = account.active_id.clone();
        let mut effect = OutcomeEffect::default();

        let Some(node) = account.node_mut(node_id) else {
            return effect;
        };
        let m = &mut node.metrics;
        m.requests += 1;
        if outcome.bytes > 0 {
            m.total_bytes += outcome.bytes;
            if let Some(d) = outcome.first_byte {
                m.first_byte_ms_total += d.as_millis() as u64;
            }
            if let Some(d) = outcome.stream {
                m.stream_ms_total += d.as_millis() as u64;
            }
        }
        m.total_input_tokens += outcome.input_tokens;
        m.total_output_tokens += outcome.output_tokens;

        let was_failed = node.failed;
        if outcome.is_success() {
            node.metrics.fail_streak = 0;
            node.last_error.clear();
        } else {
            node.metrics.fail_count += 1;
            node.metrics.fail_streak += 1;
            node.last_error = outcome
                .retry_error
                .clone()
                .unwrap_or_else(|| format!("status {}", outcome.status));
            effect.tripped = !was_failed && node.metrics.fail_streak >= fail_limit;
        }
        let streak = node.metrics.fail_streak;
        let name = node.name.clone();

        if outcome.is_success() {
            if was_failed {
                account.set_failed(node_id, false);
                effect.recovered = true;
                tracing::info!(node = %name, account = %account.id, "Node recovered by successful request");
                selector::maybe_promote_on_recovery(account, node_id);
            }
        } else if streak >= fail_limit {
            if effect.tripped {
                account.set_failed(node_id, true);
                tracing::warn!(
                    node = %name,
                    account = %account.id,
                    fail_streak = streak,
                    fail_limit,
                    status = outcome.status,
                    "Node marked failed"
                );
            }
            if let Err(e) = selector::select_best(account) {
                tracing::warn!(account = %account.id, error = %e, "No failover candidate");
            }
        }

        effect.active_changed = account.active_id != before;
        if let Some(node) = account.node(node_id) {
            self.mirror.node_state(node);
        }
        if effect.active_changed {
            self.persist_config(account);
        }
        effect
    }

    // ----- nodes -----

    /// Nodes of an account in priority order
    pub fn list_nodes(&self, account_id: &str) -> Result<Vec<Arc<Node>>, CoreError> {
        let registry = self.read();
        let account = registry
            .get_account(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))?;
        Ok(account.sorted_nodes())
    }

    pub fn get_node(&self, node_id: &str) -> Result<Arc<Node>, CoreError> {
        self.read()
            .get_node(node_id)
            .cloned()
            .ok_or_else(|| CoreError::node_not_found(node_id))
    }

    pub fn add_node(&self, account_id: &str, spec: NodeSpec) -> Result<Arc<Node>, CoreError> {
        let mut node = Node::new(account_id, &spec.name, &spec.url, spec.api_key, spec.weight)?;
        node.health_check_method = spec.health_check_method;
        let node_id = node.id.clone();

        let mut registry = self.write();
        registry.upsert_node(node)?;
        let account = registry
            .get_account_mut(account_id)
            .ok_or_else(|| CoreError::AccountMissing(account_id.to_string()))?;
        let switched = selector::maybe_switch_on_add_or_update(account, &node_id);
        let node = account
            .node(&node_id)
            .cloned()
            .ok_or_else(|| CoreError::node_not_found(&node_id))?;

        tracing::info!(
            account = %account_id,
            node = %node.name,
            url = %node.base_url(),
            weight = node.weight,
            "Node added"
        );
        self.mirror.node_saved(&node);
        if switched {
            self.persist_config(account);
        }
        Ok(node)
    }

    pub fn update_node(&self, node_id: &str, update: NodeUpdate) -> Result<Arc<Node>, CoreError> {
        // Validate everything up front so a bad field leaves the node untouched
        let url = update.url.as_deref().map(parse_node_url).transpose()?;
        if let Some(weight) = update.weight {
            validate_weight(weight)?;
        }

        let mut registry = self.write();
        let account = registry
            .get_account_of_mut(node_id)
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        let before = account.active_id.clone();
        let node = account
            .node_mut(node_id)
            .ok_or_else(|| CoreError::node_not_found(node_id))?;

        let old_weight = node.weight;
        if let Some(name) = update.name {
            node.name = name;
        }
        if let Some(url) = url {
            node.url = url;
        }
        if let Some(key) = update.api_key {
            node.api_key = normalize_api_key(key);
        }
        if let Some(weight) = update.weight {
            node.weight = weight;
        }
        if let Some(method) = update.health_check_method {
            node.health_check_method = method;
        }
        selector::maybe_switch_on_reweight(account, node_id, old_weight);

        let node = account
            .node(node_id)
            .cloned()
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        tracing::info!(account = %account.id, node = %node.name, "Node updated");
        self.mirror.node_saved(&node);
        if account.active_id != before {
            self.persist_config(account);
        }
        Ok(node)
    }

    pub fn delete_node(&self, node_id: &str) -> Result<(), CoreError> {
        let mut registry = self.write();
        let removed = registry.delete_node(node_id)?;
        let account = registry
            .get_account_mut(&removed.account_id)
            .ok_or_else(|| CoreError::AccountMissing(removed.account_id.clone()))?;

        let mut active_changed = false;
        if account.active_id.is_none() {
            // take_node cleared it: the deleted node was active
            active_changed = true;
            if let Err(e) = selector::select_best(account) {
                tracing::warn!(account = %account.id, error = %e, "No node left to activate");
            }
        }

        tracing::info!(account = %account.id, node = %removed.name, "Node deleted");
        self.mirror.node_deleted(node_id);
        if active_changed {
            self.persist_config(account);
        }
        Ok(())
    }

    pub fn enable_node(&self, node_id: &str) -> Result<Arc<Node>, CoreError> {
        self.set_disabled(node_id, false)
    }

    pub fn disable_node(&self, node_id: &str) -> Result<Arc<Node>, CoreError> {
        self.set_disabled(node_id, true)
    }

    fn set_disabled(&self, node_id: &str, disabled: bool) -> Result<Arc<Node>, CoreError> {
        let mut registry = self.write();
        let account = registry
            .get_account_of_mut(node_id)
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        let unchanged = account
            .node(node_id)
            .map(|n| n.disabled == disabled)
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        if !unchanged {
            if let Some(node) = account.node_mut(node_id) {
                node.disabled = disabled;
            }
        } else if let Some(node) = account.node(node_id) {
            return Ok(node.clone());
        }

        let switched = selector::maybe_switch_on_add_or_update(account, node_id);
        let node = account
            .node(node_id)
            .cloned()
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        tracing::info!(
            account = %account.id,
            node = %node.name,
            disabled,
            active = ?account.active_id,
            "Node toggled"
        );
        self.mirror.node_saved(&node);
        if switched {
            self.persist_config(account);
        }
        Ok(node)
    }

    /// Manually make a node active
    pub fn activate(&self, node_id: &str) -> Result<(), CoreError> {
        let mut registry = self.write();
        let account = registry
            .get_account_of_mut(node_id)
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        if selector::activate(account, node_id)? {
            self.persist_config(account);
        }
        Ok(())
    }

    pub fn update_config(
        &self,
        account_id: &str,
        update: ConfigUpdate,
    ) -> Result<AccountConfig, CoreError> {
        let mut registry = self.write();
        let account = registry
            .get_account_mut(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))?;

        let mut config = account.config;
        if let Some(retries) = update.retries {
            config.retries = retries;
        }
        if let Some(fail_limit) = update.fail_limit {
            config.fail_limit = fail_limit;
        }
        if let Some(every) = update.health_every {
            config.health_every = every;
        }
        config.validate()?;

        account.config = config;
        account.updated_at = Utc::now();
        tracing::info!(
            account = %account.id,
            retries = config.retries,
            fail_limit = config.fail_limit,
            health_every_ms = config.health_every.as_millis() as u64,
            "Routing config updated"
        );
        self.persist_config(account);
        Ok(config)
    }

    // ----- accounts -----

    pub fn create_account(&self, new: NewAccount) -> Result<AccountSnapshot, CoreError> {
        new.config.validate()?;
        let mut account = Account::new(&new.name, &new.password, &new.proxy_api_key, new.is_admin);
        if let Some(id) = &new.id {
            account = account.with_id(id);
        }
        account.config = new.config;
        let id = account.id.clone();

        let mut registry = self.write();
        if registry.get_account(&id).is_some() {
            return Err(CoreError::InvalidConfig(format!("account {} already exists", id)));
        }
        registry.register_account(account)?;
        let account = registry
            .get_account(&id)
            .ok_or_else(|| CoreError::account_not_found(&id))?;

        tracing::info!(account = %id, name = %account.name, is_admin = account.is_admin, "Account created");
        self.mirror.account_saved(AccountRecord::from(account));
        self.persist_config(account);
        Ok(account.snapshot())
    }

    /// Edit an account. Callers that are not admins may never change `is_admin`.
    pub fn update_account(
        &self,
        caller_is_admin: bool,
        account_id: &str,
        update: AccountUpdate,
    ) -> Result<AccountSnapshot, CoreError> {
        let mut registry = self.write();
        let current = registry
            .get_account(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))?;

        if let Some(is_admin) = update.is_admin {
            if !caller_is_admin && is_admin != current.is_admin {
                return Err(CoreError::Forbidden(
                    "only admins may change is_admin".to_string(),
                ));
            }
        }
        if let Some(key) = &update.proxy_api_key {
            registry.rekey_account(account_id, key)?;
        }

        let account = registry
            .get_account_mut(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))?;
        if let Some(name) = update.name {
            account.name = name;
        }
        if let Some(password) = update.password {
            account.password = password;
        }
        if let Some(is_admin) = update.is_admin {
            account.is_admin = is_admin;
        }
        account.updated_at = Utc::now();

        tracing::info!(account = %account.id, "Account updated");
        self.mirror.account_saved(AccountRecord::from(&*account));
        Ok(account.snapshot())
    }

    pub fn delete_account(&self, account_id: &str) -> Result<(), CoreError> {
        let removed = self.write().delete_account(account_id)?;
        tracing::info!(account = %removed.id, nodes = removed.node_count(), "Account deleted");
        self.mirror.account_deleted(account_id);
        Ok(())
    }

    /// All accounts, oldest first
    pub fn list_accounts(&self) -> Vec<AccountSnapshot> {
        self.snapshot_all()
    }

    pub fn snapshot(&self, account_id: &str) -> Result<AccountSnapshot, CoreError> {
        self.read()
            .snapshot_account(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))
    }

    pub fn snapshot_all(&self) -> Vec<AccountSnapshot> {
        let registry = self.read();
        let mut snapshots: Vec<AccountSnapshot> = registry.accounts().map(Account::snapshot).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    pub fn stats(&self) -> RegistryStats {
        let registry = self.read();
        let mut stats = RegistryStats {
            accounts: registry.len(),
            ..Default::default()
        };
        for account in registry.accounts() {
            stats.nodes += account.node_count();
            stats.failed += account.failed_set().len();
            stats.disabled += account.nodes().filter(|n| n.disabled).count();
        }
        stats
    }

    // ----- health -----

    /// Probe interval per account; accounts with probing disabled are left out
    pub fn health_schedule(&self) -> Vec<(String, Duration)> {
        self.read()
            .accounts()
            .filter(|a| !a.config.health_every.is_zero())
            .map(|a| (a.id.clone(), a.config.health_every))
            .collect()
    }

    /// Failed nodes of the given accounts, copied so probes run unlocked
    pub fn probe_targets(&self, account_ids: &[String]) -> Vec<ProbeTarget> {
        let registry = self.read();
        let mut targets = Vec::new();
        for account_id in account_ids {
            let Some(account) = registry.get_account(account_id) else {
                continue;
            };
            for id in account.failed_set() {
                let Some(node) = account.node(id) else {
                    continue;
                };
                targets.push(ProbeTarget {
                    account_id: account.id.clone(),
                    node_id: node.id.clone(),
                    name: node.name.clone(),
                    url: node.url.clone(),
                    api_key: node.api_key.clone(),
                    method: node.health_check_method,
                });
            }
        }
        targets
    }

    /// A probe succeeded: re-admit the node and let it preempt if it ranks higher.
    ///
    /// Returns whether the node became active.
    pub fn recover_node(&self, node_id: &str, ping_ms: u64) -> bool {
        let mut registry = self.write();
        let Some(account) = registry.get_account_of_mut(node_id) else {
            return false;
        };
        let Some(node) = account.node_mut(node_id) else {
            return false;
        };
        node.last_error.clear();
        node.metrics.fail_streak = 0;
        node.metrics.last_ping_ms = Some(ping_ms);
        node.metrics.last_ping_err.clear();
        node.metrics.last_health_check_at = Some(Utc::now());
        let name = node.name.clone();

        account.set_failed(node_id, false);
        let promoted = selector::maybe_promote_on_recovery(account, node_id);
        tracing::info!(
            account = %account.id,
            node = %name,
            ping_ms,
            promoted,
            "Node recovered by health probe"
        );

        if let Some(node) = account.node(node_id) {
            self.mirror.node_state(node);
        }
        if promoted {
            self.persist_config(account);
        }
        promoted
    }

    pub fn record_probe_failure(&self, node_id: &str, error: &str, ping_ms: Option<u64>) {
        let mut registry = self.write();
        let Some(account) = registry.get_account_of_mut(node_id) else {
            return;
        };
        let Some(node) = account.node_mut(node_id) else {
            return;
        };
        node.metrics.last_ping_err = error.to_string();
        if ping_ms.is_some() {
            node.metrics.last_ping_ms = ping_ms;
        }
        node.metrics.last_health_check_at = Some(Utc::now());
        tracing::debug!(node = %node.name, error, "Health probe failed");
        self.mirror.node_state(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane_with_account(config: AccountConfig) -> (ControlPlane, String) {
        let plane = ControlPlane::ephemeral();
        let mut new = NewAccount::new("tenant", "sk-tenant");
        new.config = config;
        let snapshot = plane.create_account(new).unwrap();
        (plane, snapshot.id)
    }

    fn add(plane: &ControlPlane, account: &str, name: &str, weight: u32) -> String {
        let node = plane
            .add_node(account, NodeSpec::new(name, "http://localhost:9", weight))
            .unwrap();
        // created_at must differ for deterministic tie-breaks
        std::thread::sleep(Duration::from_millis(2));
        node.id.clone()
    }

    fn active(plane: &ControlPlane, account: &str) -> Option<String> {
        plane.snapshot(account).unwrap().active_id
    }

    #[test]
    fn test_first_node_becomes_active() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        assert_eq!(active(&plane, &account), Some(a));
    }

    #[test]
    fn test_success_resets_streak_and_counts() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);

        plane.record_outcome(&a, &RequestOutcome::status(502));
        assert_eq!(plane.get_node(&a).unwrap().metrics.fail_streak, 1);

        let ok = RequestOutcome {
            status: 200,
            bytes: 10,
            first_byte: Some(Duration::from_millis(5)),
            stream: Some(Duration::from_millis(20)),
            input_tokens: 3,
            output_tokens: 4,
            ..Default::default()
        };
        plane.record_outcome(&a, &ok);
        let node = plane.get_node(&a).unwrap();
        assert_eq!(node.metrics.requests, 2);
        assert_eq!(node.metrics.fail_count, 1);
        assert_eq!(node.metrics.fail_streak, 0);
        assert_eq!(node.metrics.total_bytes, 10);
        assert_eq!(node.metrics.first_byte_ms_total, 5);
        assert_eq!(node.metrics.stream_ms_total, 20);
        assert_eq!(node.metrics.total_input_tokens, 3);
        assert_eq!(node.metrics.total_output_tokens, 4);
        assert!(node.last_error.is_empty());
    }

    #[test]
    fn test_threshold_trip_fails_over() {
        let config = AccountConfig {
            fail_limit: 2,
            ..Default::default()
        };
        let (plane, account) = plane_with_account(config);
        let a = add(&plane, &account, "a", 1);
        let b = add(&plane, &account, "b", 2);

        let effect = plane.record_outcome(&a, &RequestOutcome::status(500));
        assert!(!effect.tripped);
        assert_eq!(active(&plane, &account), Some(a.clone()));

        let effect = plane.record_outcome(&a, &RequestOutcome::status(500));
        assert!(effect.tripped);
        assert!(effect.active_changed);
        let node = plane.get_node(&a).unwrap();
        assert!(node.failed);
        assert_eq!(node.last_error, "status 500");
        assert_eq!(active(&plane, &account), Some(b));
        plane.with_registry(|r| r.verify()).unwrap();
    }

    #[test]
    fn test_retry_error_becomes_last_error() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        let outcome = RequestOutcome {
            status: 502,
            retry_error: Some("upstream returned 503 after 3 attempts".to_string()),
            ..Default::default()
        };
        plane.record_outcome(&a, &outcome);
        assert_eq!(
            plane.get_node(&a).unwrap().last_error,
            "upstream returned 503 after 3 attempts"
        );
    }

    #[test]
    fn test_success_on_failed_node_readmits() {
        let config = AccountConfig {
            fail_limit: 1,
            ..Default::default()
        };
        let (plane, account) = plane_with_account(config);
        let a = add(&plane, &account, "a", 1);
        plane.record_outcome(&a, &RequestOutcome::status(500));
        assert!(plane.get_node(&a).unwrap().failed);

        let effect = plane.record_outcome(&a, &RequestOutcome::status(200));
        assert!(effect.recovered);
        assert!(!plane.get_node(&a).unwrap().failed);
        assert!(plane.snapshot(&account).unwrap().failed.is_empty());
        assert_eq!(active(&plane, &account), Some(a));
    }

    #[test]
    fn test_all_failed_keeps_active_and_errors() {
        let config = AccountConfig {
            fail_limit: 1,
            ..Default::default()
        };
        let (plane, account) = plane_with_account(config);
        let a = add(&plane, &account, "a", 1);
        plane.record_outcome(&a, &RequestOutcome::status(500));
        assert_eq!(active(&plane, &account), Some(a));
        assert_eq!(
            plane.active_target(&account).unwrap_err(),
            CoreError::NoActiveNode
        );
    }

    #[test]
    fn test_disable_active_switches_immediately() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let default = add(&plane, &account, "default", 2);
        let backup = add(&plane, &account, "backup", 1);
        plane.activate(&backup).unwrap();
        plane.disable_node(&backup).unwrap();
        assert_eq!(active(&plane, &account), Some(default));

        // Re-enabling the higher priority node preempts again
        plane.enable_node(&backup).unwrap();
        assert_eq!(active(&plane, &account), Some(backup));
    }

    #[test]
    fn test_recovery_promotes_in_order() {
        let config = AccountConfig {
            fail_limit: 1,
            ..Default::default()
        };
        let (plane, account) = plane_with_account(config);
        let ids: Vec<String> = (1..=3)
            .map(|w| add(&plane, &account, &format!("n{}", w), w))
            .collect();
        for id in &ids {
            plane.record_outcome(id, &RequestOutcome::status(500));
        }
        assert_eq!(plane.snapshot(&account).unwrap().failed.len(), 3);

        let targets = plane.probe_targets(&[account.clone()]);
        assert_eq!(targets.len(), 3);

        for idx in [2, 1, 0] {
            plane.recover_node(&ids[idx], 7);
            assert_eq!(active(&plane, &account), Some(ids[idx].clone()));
            let node = plane.get_node(&ids[idx]).unwrap();
            assert!(!node.failed);
            assert_eq!(node.metrics.last_ping_ms, Some(7));
        }
        plane.with_registry(|r| r.verify()).unwrap();
    }

    #[test]
    fn test_probe_failure_records_error() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        plane.record_probe_failure(&a, "connection refused", None);
        let node = plane.get_node(&a).unwrap();
        assert_eq!(node.metrics.last_ping_err, "connection refused");
        assert!(node.metrics.last_health_check_at.is_some());
    }

    #[test]
    fn test_update_node_validates_before_mutating() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        let bad = NodeUpdate {
            name: Some("renamed".to_string()),
            url: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            plane.update_node(&a, bad),
            Err(CoreError::InvalidUrl { .. })
        ));
        assert_eq!(plane.get_node(&a).unwrap().name, "a");

        let zero = NodeUpdate {
            weight: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            plane.update_node(&a, zero),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_update_node_weight_reorders() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        let b = add(&plane, &account, "b", 2);
        assert_eq!(active(&plane, &account), Some(a.clone()));

        let demote = NodeUpdate {
            weight: Some(5),
            ..Default::default()
        };
        plane.update_node(&a, demote).unwrap();
        assert_eq!(active(&plane, &account), Some(b));

        let promote = NodeUpdate {
            weight: Some(1),
            ..Default::default()
        };
        plane.update_node(&a, promote).unwrap();
        assert_eq!(active(&plane, &account), Some(a));
    }

    #[test]
    fn test_update_node_keeps_counters() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        plane.record_outcome(&a, &RequestOutcome::status(200));
        let update = NodeUpdate {
            name: Some("renamed".to_string()),
            api_key: Some(Some("sk-new".to_string())),
            ..Default::default()
        };
        let node = plane.update_node(&a, update).unwrap();
        assert_eq!(node.metrics.requests, 1);
        assert_eq!(node.api_key.as_deref(), Some("sk-new"));
    }

    #[test]
    fn test_edit_keeps_manual_activation() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        let b = add(&plane, &account, "b", 2);
        plane.activate(&b).unwrap();

        let rename = NodeUpdate {
            name: Some("a2".to_string()),
            url: Some("http://localhost:10".to_string()),
            api_key: Some(Some("sk-a".to_string())),
            ..Default::default()
        };
        plane.update_node(&a, rename).unwrap();
        assert_eq!(active(&plane, &account), Some(b.clone()));

        // Same weight is not a rank change either
        let same = NodeUpdate {
            weight: Some(1),
            ..Default::default()
        };
        plane.update_node(&a, same).unwrap();
        assert_eq!(active(&plane, &account), Some(b));
    }

    #[test]
    fn test_delete_active_node_reselects() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let a = add(&plane, &account, "a", 1);
        let b = add(&plane, &account, "b", 2);
        plane.delete_node(&a).unwrap();
        assert_eq!(active(&plane, &account), Some(b.clone()));
        plane.delete_node(&b).unwrap();
        assert_eq!(active(&plane, &account), None);
        assert!(matches!(
            plane.delete_node(&b),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_config_ranges() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let bad = ConfigUpdate {
            retries: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            plane.update_config(&account, bad),
            Err(CoreError::InvalidConfig(_))
        ));
        assert_eq!(plane.snapshot(&account).unwrap().config.retries, 3);

        let good = ConfigUpdate {
            retries: Some(5),
            health_every: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let config = plane.update_config(&account, good).unwrap();
        assert_eq!(config.retries, 5);
        assert_eq!(config.health_every, Duration::from_secs(60));
        assert!(matches!(
            plane.update_config("missing", ConfigUpdate::default()),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_key_on_create_and_update() {
        let (plane, first) = plane_with_account(AccountConfig::default());
        let err = plane
            .create_account(NewAccount::new("other", "sk-tenant"))
            .unwrap_err();
        assert_eq!(err, CoreError::DuplicateProxyKey);

        let second = plane
            .create_account(NewAccount::new("other", "sk-other"))
            .unwrap()
            .id;
        let update = AccountUpdate {
            name: Some("changed".to_string()),
            proxy_api_key: Some("sk-tenant".to_string()),
            ..Default::default()
        };
        assert_eq!(
            plane.update_account(true, &second, update).unwrap_err(),
            CoreError::DuplicateProxyKey
        );
        let snapshot = plane.snapshot(&second).unwrap();
        assert_eq!(snapshot.name, "other");
        assert_eq!(plane.resolve_by_proxy_key("sk-tenant"), Some(first));
        assert_eq!(plane.resolve_by_proxy_key("sk-other"), Some(second));
    }

    #[test]
    fn test_non_admin_cannot_change_is_admin() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let promote = AccountUpdate {
            is_admin: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            plane.update_account(false, &account, promote.clone()),
            Err(CoreError::Forbidden(_))
        ));
        assert!(!plane.snapshot(&account).unwrap().is_admin);

        // Restating the current value is not a change
        let same = AccountUpdate {
            is_admin: Some(false),
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        plane.update_account(false, &account, same).unwrap();

        let snapshot = plane.update_account(true, &account, promote).unwrap();
        assert!(snapshot.is_admin);
        assert_eq!(snapshot.name, "renamed");
    }

    #[test]
    fn test_delete_account_removes_routing() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        add(&plane, &account, "a", 1);
        plane.delete_account(&account).unwrap();
        assert!(plane.resolve_by_proxy_key("sk-tenant").is_none());
        assert!(plane.list_accounts().is_empty());
        assert_eq!(plane.stats(), RegistryStats::default());
    }

    #[test]
    fn test_health_schedule_skips_disabled_probing() {
        let (plane, account) = plane_with_account(AccountConfig::default());
        let mut quiet = NewAccount::new("quiet", "sk-quiet");
        quiet.config.health_every = Duration::ZERO;
        plane.create_account(quiet).unwrap();
        let schedule = plane.health_schedule();
        assert_eq!(schedule, vec![(account, Duration::from_secs(30))]);
    }
}
