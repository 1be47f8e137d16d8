//! In-memory tenant and node registry
//!
//! The registry owns every account and node. Lookups by proxy key and by
//! node id go through two reverse indexes that every mutation keeps in step
//! with the primary map. Callers wrap the whole thing in a single `RwLock`.

mod account;
mod node;
pub mod selector;

pub use account::{
    Account, AccountConfig, AccountSnapshot, FAIL_LIMIT_RANGE, HEALTH_EVERY_MAX,
    HEALTH_EVERY_MIN, RETRIES_RANGE,
};
pub use node::{
    normalize_api_key, parse_node_url, validate_weight, HealthCheckMethod, Node, NodeMetrics,
    ProbeKind,
};

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreError;

#[derive(Debug, Default)]
pub struct Registry {
    accounts: HashMap<String, Account>,
    by_proxy_key: HashMap<String, String>,
    node_account: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_by_proxy_key(&self, key: &str) -> Option<&Account> {
        let id = self.by_proxy_key.get(key)?;
        self.accounts.get(id)
    }

    pub fn get_account(&self, id: &str) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn get_account_mut(&mut self, id: &str) -> Option<&mut Account> {
        self.accounts.get_mut(id)
    }

    pub fn get_node(&self, id: &str) -> Option<&Arc<Node>> {
        self.get_account_of(id)?.node(id)
    }

    pub fn get_account_of(&self, node_id: &str) -> Option<&Account> {
        let account_id = self.node_account.get(node_id)?;
        self.accounts.get(account_id)
    }

    pub fn get_account_of_mut(&mut self, node_id: &str) -> Option<&mut Account> {
        let account_id = self.node_account.get(node_id)?;
        self.accounts.get_mut(account_id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn has_admin(&self) -> bool {
        self.accounts.values().any(|a| a.is_admin)
    }

    /// True when `key` is free or already owned by `account_id`
    pub fn proxy_key_available(&self, key: &str, account_id: &str) -> bool {
        match self.by_proxy_key.get(key) {
            Some(owner) => owner == account_id,
            None => true,
        }
    }

    /// Insert a new account or replace one with the same id.
    ///
    /// Fails with `DuplicateProxyKey` (leaving the registry untouched) when
    /// another account already routes the key.
    pub fn register_account(&mut self, account: Account) -> Result<(), CoreError> {
        validate_proxy_key(&account.proxy_api_key)?;
        if !self.proxy_key_available(&account.proxy_api_key, &account.id) {
            return Err(CoreError::DuplicateProxyKey);
        }

        if let Some(previous) = self.accounts.remove(&account.id) {
            self.by_proxy_key.remove(&previous.proxy_api_key);
            for node in previous.nodes() {
                self.node_account.remove(&node.id);
            }
        }

        self.by_proxy_key
            .insert(account.proxy_api_key.clone(), account.id.clone());
        for node in account.nodes() {
            self.node_account.insert(node.id.clone(), account.id.clone());
        }
        self.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    /// Move an account to a new proxy key
    pub fn rekey_account(&mut self, account_id: &str, new_key: &str) -> Result<(), CoreError> {
        validate_proxy_key(new_key)?;
        if !self.proxy_key_available(new_key, account_id) {
            return Err(CoreError::DuplicateProxyKey);
        }
        let account = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))?;
        if account.proxy_api_key == new_key {
            return Ok(());
        }
        self.by_proxy_key.remove(&account.proxy_api_key);
        account.proxy_api_key = new_key.to_string();
        self.by_proxy_key
            .insert(new_key.to_string(), account_id.to_string());
        Ok(())
    }

    /// Insert or replace a node under its owning account
    pub fn upsert_node(&mut self, node: Node) -> Result<(), CoreError> {
        if let Some(owner) = self.node_account.get(&node.id) {
            if owner != &node.account_id {
                return Err(CoreError::InvalidConfig(format!(
                    "node {} belongs to another account",
                    node.id
                )));
            }
        }
        let account = self
            .accounts
            .get_mut(&node.account_id)
            .ok_or_else(|| CoreError::AccountMissing(node.account_id.clone()))?;
        self.node_account
            .insert(node.id.clone(), node.account_id.clone());
        account.put_node(node);
        Ok(())
    }

    pub fn delete_node(&mut self, node_id: &str) -> Result<Arc<Node>, CoreError> {
        let account_id = self
            .node_account
            .get(node_id)
            .cloned()
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| CoreError::AccountMissing(account_id.clone()))?;
        let node = account
            .take_node(node_id)
            .ok_or_else(|| CoreError::node_not_found(node_id))?;
        self.node_account.remove(node_id);
        Ok(node)
    }

    pub fn delete_account(&mut self, account_id: &str) -> Result<Account, CoreError> {
        let account = self
            .accounts
            .remove(account_id)
            .ok_or_else(|| CoreError::account_not_found(account_id))?;
        self.by_proxy_key.remove(&account.proxy_api_key);
        for node in account.nodes() {
            self.node_account.remove(&node.id);
        }
        Ok(account)
    }

    pub fn snapshot_account(&self, account_id: &str) -> Option<AccountSnapshot> {
        self.accounts.get(account_id).map(Account::snapshot)
    }

    /// Check the structural invariants; returns a description of the first
    /// violation found
    pub fn verify(&self) -> Result<(), String> {
        for account in self.accounts.values() {
            if self.by_proxy_key.get(&account.proxy_api_key) != Some(&account.id) {
                return Err(format!("account {} missing from key index", account.id));
            }
            for node in account.nodes() {
                if node.account_id != account.id {
                    return Err(format!("node {} has wrong account_id", node.id));
                }
                if self.node_account.get(&node.id) != Some(&account.id) {
                    return Err(format!("node {} missing from node index", node.id));
                }
                if node.failed != account.failed_set().contains(&node.id) {
                    return Err(format!("node {} failed flag out of sync", node.id));
                }
            }
            for id in account.failed_set() {
                if account.node(id).is_none() {
                    return Err(format!("failed_set names unknown node {}", id));
                }
            }
        }
        if self.by_proxy_key.len() != self.accounts.len() {
            return Err("key index size mismatch".to_string());
        }
        let node_total: usize = self.accounts.values().map(Account::node_count).sum();
        if self.node_account.len() != node_total {
            return Err("node index size mismatch".to_string());
        }
        Ok(())
    }
}

fn validate_proxy_key(key: &str) -> Result<(), CoreError> {
    if key.trim().is_empty() {
        return Err(CoreError::InvalidConfig(
            "proxy_api_key must not be empty".to_string(),
        ));
    }
    Ok(())
}
