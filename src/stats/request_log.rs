//! One-line request and outcome summaries for logs

use std::time::Duration;

use crate::control::RequestOutcome;

/// Format an Anthropic-style request body in compact form
pub fn format_request_log(request_json: &serde_json::Value) -> String {
    let model = request_json.get("model").and_then(|m| m.as_str()).unwrap_or("unknown");

    let msg_count = request_json
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|a| a.len())
        .unwrap_or(0);

    let max_tokens = request_json.get("max_tokens").and_then(|m| m.as_u64());
    let is_streaming = request_json.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    let has_system = request_json.get("system").is_some_and(|s| !s.is_null());
    let tools_count = request_json.get("tools").and_then(|t| t.as_array()).map(|a| a.len());

    let mut parts = vec![format!("model={}", model), format!("msgs={}", msg_count)];

    if let Some(max) = max_tokens {
        parts.push(format!("max={}", max));
    }
    if is_streaming {
        parts.push("stream".to_string());
    }
    if has_system {
        parts.push("system".to_string());
    }
    if let Some(count) = tools_count.filter(|c| *c > 0) {
        parts.push(format!("tools={}", count));
    }
    if let Some(msg) = extract_first_user_message(request_json) {
        parts.push(format!("\"{}\"", msg));
    }

    format!("→ {}", parts.join(" "))
}

/// Format what a finished request did to its node
pub fn format_outcome_log(node_name: &str, outcome: &RequestOutcome, total: Duration) -> String {
    let mut parts = vec![
        format!("node={}", node_name),
        format!("status={}", outcome.status),
        format!("bytes={}", outcome.bytes),
    ];
    if let Some(first_byte) = outcome.first_byte {
        parts.push(format!("ttfb={}ms", first_byte.as_millis()));
    }
    parts.push(format!("total={}ms", total.as_millis()));
    if outcome.input_tokens > 0 || outcome.output_tokens > 0 {
        parts.push(format!("tokens={}/{}", outcome.input_tokens, outcome.output_tokens));
    }
    if let Some(err) = &outcome.retry_error {
        parts.push(format!("error=\"{}\"", err));
    }
    format!("← {}", parts.join(" "))
}

/// First user turn that carries text, normalized and truncated
fn extract_first_user_message(request_json: &serde_json::Value) -> Option<String> {
    let messages = request_json.get("messages")?.as_array()?;

    messages
        .iter()
        .filter(|msg| msg.get("role").and_then(|r| r.as_str()) == Some("user"))
        .find_map(extract_message_content)
        .map(|content| truncate_message(&normalize_whitespace(&content)))
}

/// Text of a message; string content or the `text` blocks of block content
fn extract_message_content(msg: &serde_json::Value) -> Option<String> {
    let content = msg.get("content")?;

    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }

    let texts: Vec<&str> = content
        .as_array()?
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
        .collect();
    (!texts.is_empty()).then(|| texts.join(" "))
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Up to 100 chars verbatim; longer text keeps the first 25 and last 75
fn truncate_message(s: &str) -> String {
    const MAX_TOTAL: usize = 100;
    const PREFIX_LEN: usize = 25;
    const SUFFIX_LEN: usize = 75;
    const ELLIPSIS: &str = " ... ";

    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= MAX_TOTAL {
        return s.to_string();
    }

    let prefix: String = chars[..PREFIX_LEN].iter().collect();
    let suffix: String = chars[chars.len() - SUFFIX_LEN..].iter().collect();
    format!("{}{}{}", prefix, ELLIPSIS, suffix)
}
