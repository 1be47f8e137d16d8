//! Durable mirror of the registry
//!
//! The registry is the source of truth while the process runs. Every
//! mutation is written through to a [`Store`] by the [`Mirror`], and on
//! startup [`rebuild_registry`] reconstructs the registry from it, counters
//! included.

mod mirror;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use mirror::Mirror;
pub use sqlite::SqliteStore;

use crate::registry::{selector, Account, AccountConfig, Node, Registry};

/// Account columns as stored
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    pub password: String,
    pub proxy_api_key: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Account> for AccountRecord {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            password: account.password.clone(),
            proxy_api_key: account.proxy_api_key.clone(),
            is_admin: account.is_admin,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// Routing config row of an account
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRecord {
    pub config: AccountConfig,
    pub active_node: Option<String>,
}

impl From<&Account> for ConfigRecord {
    fn from(account: &Account) -> Self {
        Self {
            config: account.config,
            active_node: account.active_id.clone(),
        }
    }
}

/// Persistent backing for the registry
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_accounts(&self) -> Result<Vec<AccountRecord>, StoreError>;

    async fn load_nodes(&self, account_id: &str) -> Result<Vec<Node>, StoreError>;

    async fn load_config(&self, account_id: &str) -> Result<Option<ConfigRecord>, StoreError>;

    async fn upsert_account(&self, account: &AccountRecord) -> Result<(), StoreError>;

    async fn delete_account(&self, account_id: &str) -> Result<(), StoreError>;

    /// Write a node's configuration columns.
    ///
    /// A new row takes the node's counters as given; an existing row keeps
    /// its stored counters and runtime state untouched.
    async fn upsert_node(&self, node: &Node) -> Result<(), StoreError>;

    /// Write a node's runtime state (failed flag, last error) and counters
    async fn save_node_state(&self, node: &Node) -> Result<(), StoreError>;

    async fn delete_node(&self, node_id: &str) -> Result<(), StoreError>;

    async fn save_config(&self, account_id: &str, config: &ConfigRecord) -> Result<(), StoreError>;

    /// Name of the store (for logging)
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Registry rebuilt from a store
#[derive(Debug)]
pub struct Rebuilt {
    pub registry: Registry,
    /// Accounts whose stored active node was unusable and got reselected
    pub reselected: Vec<String>,
}

/// Reconstruct the registry from persisted rows.
///
/// Counters come back exactly as stored. A stored active node that is
/// missing, failed or disabled is replaced by the selector right away.
pub async fn rebuild_registry(store: &dyn Store) -> Result<Rebuilt, StoreError> {
    let mut registry = Registry::new();
    let mut reselected = Vec::new();

    for record in store.load_accounts().await? {
        let mut account = Account::new(
            &record.name,
            &record.password,
            &record.proxy_api_key,
            record.is_admin,
        )
        .with_id(&record.id);
        account.created_at = record.created_at;
        account.updated_at = record.updated_at;

        let config = store.load_config(&record.id).await?;
        if let Some(ref config) = config {
            account.config = config.config;
            account.active_id = config.active_node.clone().filter(|id| !id.is_empty());
        }

        for node in store.load_nodes(&record.id).await? {
            if node.account_id != account.id {
                return Err(StoreError::Corrupt {
                    table: "nodes",
                    reason: format!("node {} loaded for account {}", node.id, account.id),
                });
            }
            account.put_node(node);
        }

        if selector::usable_active(&account).is_none() {
            let before = account.active_id.clone();
            if selector::select_best(&mut account).is_err() {
                tracing::warn!(account = %account.id, "No healthy node available after restart");
            }
            if account.active_id != before {
                reselected.push(account.id.clone());
            }
        }

        tracing::debug!(
            account = %account.id,
            nodes = account.node_count(),
            active = ?account.active_id,
            "Rebuilt account from store"
        );

        if let Err(e) = registry.register_account(account) {
            return Err(StoreError::Corrupt {
                table: "accounts",
                reason: format!("account {}: {}", record.id, e),
            });
        }
    }

    Ok(Rebuilt {
        registry,
        reselected,
    })
}
