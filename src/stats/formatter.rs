//! Node table formatting for different output formats

use serde::{Deserialize, Serialize};

use crate::registry::{AccountSnapshot, Node};

/// Output format of `list-nodes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Format every account's nodes according to `format`
pub fn format_accounts(accounts: &[AccountSnapshot], format: OutputFormat) -> String {
    match format {
        OutputFormat::Pretty => accounts.iter().map(format_pretty).collect::<Vec<_>>().join("\n"),
        OutputFormat::Json => format_json(accounts),
        OutputFormat::Compact => accounts.iter().map(format_compact).collect::<Vec<_>>().join("\n"),
    }
}

fn node_state(node: &Node, active: bool) -> &'static str {
    match (active, node.disabled, node.failed) {
        (_, true, _) => "disabled",
        (_, _, true) => "FAILED",
        (true, _, _) => "active",
        _ => "standby",
    }
}

/// Box table for terminal output
fn format_pretty(account: &AccountSnapshot) -> String {
    let mut out = String::new();
    out.push_str("┌──────────────────────────────────────────────────────────────────────────────┐\n");
    out.push_str(&format!(
        "│ {:76} │\n",
        truncate(
            &format!(
                "Account {} ({}){}",
                account.name,
                account.id,
                if account.is_admin { " admin" } else { "" }
            ),
            76
        )
    ));
    out.push_str(&format!(
        "│ {:76} │\n",
        format!(
            "retries={} fail_limit={} health_every={}s",
            account.config.retries,
            account.config.fail_limit,
            account.config.health_every.as_secs()
        )
    ));
    out.push_str("├──────────────────────────────────────────────────────────────────────────────┤\n");
    out.push_str(&format!(
        "│ {:<16} {:>3} {:<8} {:>8} {:>6} {:>6} {:>10} {:>12} │\n",
        "Node", "W", "State", "Reqs", "Fails", "Streak", "Avg TTFB", "Tokens in/out"
    ));

    if account.nodes.is_empty() {
        out.push_str(&format!("│ {:76} │\n", "(no nodes)"));
    }
    for node in &account.nodes {
        let active = account.active_id.as_deref() == Some(node.id.as_str());
        let m = &node.metrics;
        let ttfb = m
            .avg_first_byte_ms()
            .map(|ms| format!("{:.0}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "│ {:<16} {:>3} {:<8} {:>8} {:>6} {:>6} {:>10} {:>12} │\n",
            truncate(&node.name, 16),
            node.weight,
            node_state(node, active),
            m.requests,
            m.fail_count,
            m.fail_streak,
            ttfb,
            truncate(&format!("{}/{}", m.total_input_tokens, m.total_output_tokens), 12),
        ));
        out.push_str(&format!("│   {:74} │\n", truncate(node.url.as_str(), 74)));
        if !node.last_error.is_empty() {
            out.push_str(&format!("│   {:74} │\n", truncate(&format!("last error: {}", node.last_error), 74)));
        }
    }
    out.push_str("└──────────────────────────────────────────────────────────────────────────────┘\n");
    out
}

/// JSON for scripting; node api keys are never serialized
fn format_json(accounts: &[AccountSnapshot]) -> String {
    serde_json::to_string_pretty(accounts).unwrap_or_else(|_| "[]".to_string())
}

/// One line per node
fn format_compact(account: &AccountSnapshot) -> String {
    account
        .nodes
        .iter()
        .map(|node| {
            let active = account.active_id.as_deref() == Some(node.id.as_str());
            format!(
                "{} {} w={} {} reqs={} fails={} streak={} bytes={} tokens={}/{} url={}",
                account.name,
                node.name,
                node.weight,
                node_state(node, active),
                node.metrics.requests,
                node.metrics.fail_count,
                node.metrics.fail_streak,
                node.metrics.total_bytes,
                node.metrics.total_input_tokens,
                node.metrics.total_output_tokens,
                node.url
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate a string to max chars with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
