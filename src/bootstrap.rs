//! Startup wiring: store, registry rebuild, seeding

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, ConfigError, DefaultAccountConfig};
use crate::control::{ControlPlane, NewAccount, NodeSpec};
use crate::error::CoreError;
use crate::registry::AccountConfig;
use crate::store::{rebuild_registry, Mirror, SqliteStore, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("seeding failed: {0}")]
    Seed(#[from] CoreError),
}

/// Everything the server needs from startup
pub struct Bootstrapped {
    pub control: ControlPlane,
    pub store: Arc<dyn Store>,
    pub mirror_task: JoinHandle<()>,
    /// Account serving requests without a known proxy key
    pub fallback_account: Option<String>,
}

/// Open the configured database and build the control plane over it
pub async fn bootstrap(config: &AppConfig) -> Result<Bootstrapped, BootstrapError> {
    config.validate()?;
    let store = SqliteStore::connect(&config.database.url, config.database.max_connections).await?;
    bootstrap_with_store(config, Arc::new(store)).await
}

/// Rebuild the registry from `store`, seed what is missing, start the mirror
pub async fn bootstrap_with_store(
    config: &AppConfig,
    store: Arc<dyn Store>,
) -> Result<Bootstrapped, BootstrapError> {
    let rebuilt = rebuild_registry(store.as_ref()).await?;
    let empty = rebuilt.registry.is_empty();
    tracing::info!(
        store = store.name(),
        accounts = rebuilt.registry.len(),
        reselected = rebuilt.reselected.len(),
        "Registry rebuilt from store"
    );

    let (mirror, mirror_task) = Mirror::spawn(store.clone());
    let control = ControlPlane::new(rebuilt.registry, mirror);

    // Persist active nodes the rebuild had to replace
    for account_id in &rebuilt.reselected {
        control.persist_active(account_id);
    }

    match &config.bootstrap.default_account {
        Some(default) if empty => seed_default_account(&control, default)?,
        Some(default) if !control.account_exists(&default.account_id()) => {
            tracing::info!(
                account = %default.account_id(),
                "Default account missing from a non-empty store, not recreating it"
            );
        }
        _ => {}
    }

    if !control.with_registry(|r| r.has_admin()) {
        seed_admin(&control, config)?;
    }

    let fallback_account = match config.fallback_account_id() {
        Some(id) if control.account_exists(&id) => {
            tracing::info!(account = %id, "Unauthenticated requests fall back to account");
            Some(id)
        }
        Some(id) => {
            tracing::warn!(account = %id, "Fallback account does not exist, fallback disabled");
            None
        }
        None => None,
    };

    control.mirror().flush().await;
    Ok(Bootstrapped {
        control,
        store,
        mirror_task,
        fallback_account,
    })
}

fn seed_default_account(
    control: &ControlPlane,
    default: &DefaultAccountConfig,
) -> Result<(), CoreError> {
    let account = control.create_account(NewAccount {
        id: Some(default.account_id()),
        name: default.name.clone(),
        password: default.password.clone(),
        proxy_api_key: default.proxy_api_key.clone(),
        is_admin: false,
        config: default.account_config(),
    })?;

    for seed in &default.nodes {
        let spec = NodeSpec {
            name: seed.name.clone(),
            url: seed.url.clone(),
            api_key: seed.api_key.clone(),
            weight: seed.weight,
            health_check_method: seed.health_check_method,
        };
        control.add_node(&account.id, spec)?;
    }

    tracing::info!(
        account = %account.id,
        nodes = default.nodes.len(),
        "Seeded default account"
    );
    Ok(())
}

fn seed_admin(control: &ControlPlane, config: &AppConfig) -> Result<(), CoreError> {
    let admin = &config.bootstrap.admin;
    let key = match &admin.proxy_api_key {
        Some(key) => key.clone(),
        None => {
            let key = format!("sk-admin-{}", uuid::Uuid::new_v4().simple());
            tracing::warn!(proxy_api_key = %key, "No admin key configured, generated one");
            key
        }
    };

    let account = control.create_account(NewAccount {
        id: None,
        name: admin.name.clone(),
        password: admin.password.clone(),
        proxy_api_key: key,
        is_admin: true,
        config: AccountConfig::default(),
    })?;
    tracing::info!(account = %account.id, name = %account.name, "Created admin account");
    Ok(())
}
