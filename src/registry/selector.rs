//! Active-node selection
//!
//! Strict priority, no balancing: the healthy node with the lowest
//! `(weight, created_at)` wins. Every function here runs with the registry
//! write lock held by the caller and reports whether `active_id` moved.

use std::sync::Arc;

use super::account::Account;
use super::node::Node;
use crate::error::CoreError;

/// Best healthy node of the account, if any
pub fn best_candidate(account: &Account) -> Option<&Arc<Node>> {
    account
        .nodes()
        .filter(|n| n.is_healthy())
        .min_by(|a, b| a.priority_key().cmp(&b.priority_key()))
}

/// Pick the best healthy node and make it active.
///
/// With no healthy candidate `active_id` is left as it was and
/// `NoActiveNode` is returned.
pub fn select_best(account: &mut Account) -> Result<Arc<Node>, CoreError> {
    let best = best_candidate(account).cloned().ok_or(CoreError::NoActiveNode)?;
    if account.active_id.as_deref() != Some(best.id.as_str()) {
        tracing::info!(
            account = %account.id,
            from = ?account.active_id,
            to = %best.id,
            node = %best.name,
            "Switching active node"
        );
        account.active_id = Some(best.id.clone());
    }
    Ok(best)
}

/// Current active node if it is still usable, otherwise reselect
pub fn get_active(account: &mut Account) -> Result<Arc<Node>, CoreError> {
    if let Some(active) = usable_active(account) {
        return Ok(active.clone());
    }
    select_best(account)
}

/// The active node when it exists and is neither failed nor disabled
pub fn usable_active(account: &Account) -> Option<&Arc<Node>> {
    account.active_node().filter(|n| n.is_healthy())
}

/// After a node recovers, promote it if the current active is gone,
/// unhealthy, or outranked by the recovered node.
pub fn maybe_promote_on_recovery(account: &mut Account, node_id: &str) -> bool {
    let Some(node) = account.node(node_id).cloned() else {
        return false;
    };
    if !node.is_healthy() {
        return false;
    }
    let promote = match usable_active(account) {
        None => true,
        Some(active) => active.id != node.id && node.outranks(active),
    };
    if promote {
        tracing::info!(
            account = %account.id,
            from = ?account.active_id,
            to = %node.id,
            node = %node.name,
            "Promoting recovered node"
        );
        account.active_id = Some(node.id.clone());
    }
    promote
}

/// After a node is added, enabled or edited, let it preempt the active node
/// when it ranks higher. If the node is the active one and just became
/// unusable, fall back to the best remaining candidate.
pub fn maybe_switch_on_add_or_update(account: &mut Account, node_id: &str) -> bool {
    let Some(node) = account.node(node_id).cloned() else {
        return false;
    };
    let before = account.active_id.clone();

    if !node.is_healthy() {
        if before.as_deref() == Some(node.id.as_str()) {
            let _ = select_best(account);
        }
        return account.active_id != before;
    }

    let switch = match usable_active(account) {
        None => true,
        Some(active) => active.id != node.id && node.outranks(active),
    };
    if switch {
        tracing::info!(
            account = %account.id,
            from = ?before,
            to = %node.id,
            node = %node.name,
            "Switching active node to higher priority node"
        );
        account.active_id = Some(node.id.clone());
    }
    account.active_id != before
}

/// After a node's weight changed from `old_weight`.
///
/// A lowered weight may preempt the active node; a raised weight on the
/// active node hands over to whoever outranks it now. Any other edit leaves
/// `active_id` alone, so a manual activation survives renames and re-keys.
pub fn maybe_switch_on_reweight(account: &mut Account, node_id: &str, old_weight: u32) -> bool {
    let Some(weight) = account.node(node_id).map(|n| n.weight) else {
        return false;
    };
    if weight < old_weight {
        return maybe_switch_on_add_or_update(account, node_id);
    }
    if weight > old_weight && account.active_id.as_deref() == Some(node_id) {
        let before = account.active_id.clone();
        let _ = select_best(account);
        return account.active_id != before;
    }
    false
}

/// Manual override: make a specific healthy node active
pub fn activate(account: &mut Account, node_id: &str) -> Result<bool, CoreError> {
    let node = account
        .node(node_id)
        .cloned()
        .ok_or_else(|| CoreError::node_not_found(node_id))?;
    if node.disabled {
        return Err(CoreError::InvalidConfig(format!(
            "node '{}' is disabled and cannot be activated",
            node.name
        )));
    }
    if node.failed {
        return Err(CoreError::InvalidConfig(format!(
            "node '{}' is failed and cannot be activated until it recovers",
            node.name
        )));
    }
    if account.active_id.as_deref() == Some(node_id) {
        return Ok(false);
    }
    tracing::info!(
        account = %account.id,
        from = ?account.active_id,
        to = %node.id,
        node = %node.name,
        "Activating node"
    );
    account.active_id = Some(node.id.clone());
    Ok(true)
}
