//! Ordered write-through of registry mutations

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{AccountRecord, ConfigRecord, Store, StoreError};
use crate::registry::Node;

enum MirrorOp {
    AccountSaved(AccountRecord),
    AccountDeleted(String),
    NodeSaved(Node),
    NodeState(Node),
    NodeDeleted(String),
    ConfigSaved(String, ConfigRecord),
    Flush(oneshot::Sender<()>),
}

impl MirrorOp {
    fn label(&self) -> &'static str {
        match self {
            MirrorOp::AccountSaved(_) => "account_saved",
            MirrorOp::AccountDeleted(_) => "account_deleted",
            MirrorOp::NodeSaved(_) => "node_saved",
            MirrorOp::NodeState(_) => "node_state",
            MirrorOp::NodeDeleted(_) => "node_deleted",
            MirrorOp::ConfigSaved(..) => "config_saved",
            MirrorOp::Flush(_) => "flush",
        }
    }
}

/// Handle to the background writer.
///
/// Calls only enqueue; a single task applies them to the store in the order
/// they were issued. Store errors are logged and dropped, the in-memory state
/// stays authoritative.
#[derive(Clone)]
pub struct Mirror {
    tx: Option<mpsc::UnboundedSender<MirrorOp>>,
}

impl Mirror {
    /// Start the writer task over `store`
    pub fn spawn(store: Arc<dyn Store>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, rx));
        (Self { tx: Some(tx) }, handle)
    }

    /// A mirror that discards every write
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn send(&self, op: MirrorOp) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.send(op) {
            tracing::warn!(op = e.0.label(), "Mirror writer stopped, dropping write");
        }
    }

    pub fn account_saved(&self, record: AccountRecord) {
        self.send(MirrorOp::AccountSaved(record));
    }

    pub fn account_deleted(&self, account_id: &str) {
        self.send(MirrorOp::AccountDeleted(account_id.to_string()));
    }

    /// Configuration columns of a node (counters on an existing row are kept)
    pub fn node_saved(&self, node: &Node) {
        self.send(MirrorOp::NodeSaved(node.clone()));
    }

    /// Runtime flags and counters of a node
    pub fn node_state(&self, node: &Node) {
        self.send(MirrorOp::NodeState(node.clone()));
    }

    pub fn node_deleted(&self, node_id: &str) {
        self.send(MirrorOp::NodeDeleted(node_id.to_string()));
    }

    pub fn config_saved(&self, account_id: &str, record: ConfigRecord) {
        self.send(MirrorOp::ConfigSaved(account_id.to_string(), record));
    }

    /// Wait until every write queued before this call has been applied
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(MirrorOp::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_writer(store: Arc<dyn Store>, mut rx: mpsc::UnboundedReceiver<MirrorOp>) {
    tracing::debug!(store = store.name(), "Mirror writer started");
    while let Some(op) = rx.recv().await {
        let label = op.label();
        if let Err(e) = apply(store.as_ref(), op).await {
            tracing::warn!(
                store = store.name(),
                op = label,
                error = %e,
                "Failed to persist registry change"
            );
        }
    }
    tracing::debug!(store = store.name(), "Mirror writer stopped");
}

async fn apply(store: &dyn Store, op: MirrorOp) -> Result<(), StoreError> {
    match op {
        MirrorOp::AccountSaved(record) => store.upsert_account(&record).await,
        MirrorOp::AccountDeleted(id) => store.delete_account(&id).await,
        MirrorOp::NodeSaved(node) => store.upsert_node(&node).await,
        MirrorOp::NodeState(node) => store.save_node_state(&node).await,
        MirrorOp::NodeDeleted(id) => store.delete_node(&id).await,
        MirrorOp::ConfigSaved(account_id, record) => store.save_config(&account_id, &record).await,
        MirrorOp::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Account;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn test_writes_apply_in_order() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (mirror, _handle) = Mirror::spawn(store.clone());

        let account = Account::new("t", "pw", "sk", false);
        let node = Node::new(&account.id, "n", "http://localhost", None, 1).unwrap();
        mirror.account_saved(AccountRecord::from(&account));
        mirror.node_saved(&node);
        let mut updated = node.clone();
        updated.metrics.requests = 9;
        mirror.node_state(&updated);
        mirror.flush().await;

        let nodes = store.load_nodes(&account.id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].metrics.requests, 9);

        mirror.node_deleted(&node.id);
        mirror.account_deleted(&account.id);
        mirror.flush().await;
        assert!(store.load_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_errors_do_not_stop_writer() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (mirror, _handle) = Mirror::spawn(store.clone());

        // Node for a missing account violates the foreign key
        let orphan = Node::new("ghost", "n", "http://localhost", None, 1).unwrap();
        mirror.node_saved(&orphan);

        let account = Account::new("t", "pw", "sk", false);
        mirror.account_saved(AccountRecord::from(&account));
        mirror.flush().await;
        assert_eq!(store.load_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_mirror_is_noop() {
        let mirror = Mirror::disabled();
        mirror.account_deleted("x");
        mirror.flush().await;
    }
}
