//! `tools[]` cleanup for outbound JSON bodies

use bytes::Bytes;
use serde_json::Value;

/// Keys a tool definition may carry upstream; everything else is rejected
/// by the upstream with a 400.
pub const TOOL_KEYS: [&str; 3] = ["name", "description", "input_schema"];

/// Check if a Content-Type names a JSON body
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("application/json")
}

/// Strip unknown keys from every tool object.
///
/// Returns the original bytes untouched (and `false`) when the body is not
/// JSON, has no non-empty `tools` array, or every tool is already clean.
pub fn sanitize_tools(body: &Bytes) -> (Bytes, bool) {
    let Ok(mut json) = serde_json::from_slice::<Value>(body) else {
        return (body.clone(), false);
    };
    if !strip_tool_keys(&mut json) {
        return (body.clone(), false);
    }
    match serde_json::to_vec(&json) {
        Ok(encoded) => (Bytes::from(encoded), true),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to re-encode sanitized body, forwarding original");
            (body.clone(), false)
        }
    }
}

/// In-place variant over a parsed body; returns whether anything was dropped
pub fn strip_tool_keys(json: &mut Value) -> bool {
    let Some(tools) = json.get_mut("tools").and_then(Value::as_array_mut) else {
        return false;
    };

    let mut changed = false;
    for tool in tools.iter_mut() {
        let Some(object) = tool.as_object_mut() else {
            continue;
        };
        let before = object.len();
        object.retain(|key, _| TOOL_KEYS.contains(&key.as_str()));
        if object.len() != before {
            let name = object.get("name").and_then(|n| n.as_str()).unwrap_or("?");
            tracing::debug!(
                tool = name,
                dropped = before - object.len(),
                "Dropped unsupported tool keys"
            );
            changed = true;
        }
    }
    changed
}
