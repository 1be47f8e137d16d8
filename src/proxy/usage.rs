//! Token usage extraction from upstream responses
//!
//! Works on the captured prefix of a response body, which is either a single
//! JSON message or an SSE stream. Anthropic streams report `input_tokens` in
//! `message_start` and the final `output_tokens` in the last `message_delta`,
//! so the scan runs backwards and falls back to earlier `usage` objects for
//! whatever the last one lacks.

use axum::http::HeaderMap;
use serde_json::Value;

pub const INPUT_TOKENS_HEADER: &str = "x-usage-input-tokens";
pub const OUTPUT_TOKENS_HEADER: &str = "x-usage-output-tokens";

const USAGE_KEY: &[u8] = b"\"usage\"";

/// Token counts reported by the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Usage announced in response headers, if the upstream sets them
pub fn usage_from_headers(headers: &HeaderMap) -> Option<Usage> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    let input = read(INPUT_TOKENS_HEADER);
    let output = read(OUTPUT_TOKENS_HEADER);
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(Usage {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
    })
}

/// Usage from the tail of a captured body; zeros when nothing parses
pub fn extract_usage(capture: &[u8]) -> Usage {
    let mut input: Option<u64> = None;
    let mut output: Option<u64> = None;
    let mut end = capture.len();

    while let Some(pos) = rfind(&capture[..end], USAGE_KEY) {
        end = pos;
        let Some(object) = usage_object(capture, pos + USAGE_KEY.len()) else {
            continue;
        };
        if output.is_none() {
            output = token_field(&object, "output_tokens");
        }
        if input.is_none() {
            input = token_field(&object, "input_tokens");
        }
        if input.is_some() && output.is_some() {
            break;
        }
    }

    Usage {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
    }
}

fn token_field(object: &Value, key: &str) -> Option<u64> {
    object.get(key).and_then(Value::as_u64)
}

/// Parse the object value following a `"usage"` key
fn usage_object(buf: &[u8], after_key: usize) -> Option<Value> {
    let mut i = after_key;
    while i < buf.len() && (buf[i].is_ascii_whitespace() || buf[i] == b':') {
        i += 1;
    }
    if buf.get(i) != Some(&b'{') {
        return None;
    }
    let end = matching_brace(buf, i)?;
    let value: Value = serde_json::from_slice(&buf[i..=end]).ok()?;
    value.is_object().then_some(value)
}

/// Index of the `}` closing the `{` at `start`, skipping braces inside strings
fn matching_brace(buf: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in buf[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
