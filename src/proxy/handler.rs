//! Request/response handler for the proxy

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::{Duration, Instant};

use super::retry::{Dispatch, OutboundRequest, RETRY_ERROR_HEADER};
use super::sanitize::{is_json_content_type, sanitize_tools};
use super::server::ProxyState;
use super::streaming::{MeteredStream, StreamEnd, StreamSummary};
use super::usage::{extract_usage, usage_from_headers};
use crate::control::{RequestOutcome, Route};
use crate::error::CoreError;
use crate::stats::{format_outcome_log, format_request_log};

pub const PROXY_NODE_HEADER: &str = "x-proxy-node";

/// Status recorded when the client hangs up mid-body
pub const CLIENT_CLOSED_STATUS: u16 = 499;

/// Paths owned by collaborators mounted in front of the proxy
const RESERVED_PREFIXES: [&str; 4] = ["/admin/", "/api/", "/static/", "/assets/"];
const RESERVED_PATHS: [&str; 6] = ["/admin", "/login", "/logout", "/version", "/changelog", "/favicon.ico"];

/// Check if a path belongs to a collaborator instead of an upstream
pub fn is_reserved_path(path: &str) -> bool {
    if RESERVED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return true;
    }
    RESERVED_PATHS
        .iter()
        .any(|p| path == *p || path.strip_prefix(p).is_some_and(|rest| rest.starts_with('/')))
}

/// Proxy keys presented by the client: `x-api-key` first, then
/// `Authorization: Bearer`
pub fn extract_proxy_keys(headers: &HeaderMap) -> Vec<&str> {
    let mut keys = Vec::with_capacity(2);
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let key = key.trim();
        if !key.is_empty() {
            keys.push(key);
        }
    }
    if let Some(token) = bearer_token(headers) {
        if !keys.contains(&token) {
            keys.push(token);
        }
    }
    keys
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = auth.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
    ) || name.as_str().starts_with("proxy-")
}

/// Client headers rewritten for the selected node
pub fn outbound_headers(client: &HeaderMap, route: &Route) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(client.len() + 3);
    for (name, value) in client {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::ACCEPT_ENCODING
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(host) = route.node.host_header().and_then(|h| HeaderValue::from_str(&h).ok()) {
        headers.insert(header::HOST, host);
    }

    if let Some(key) = route.node.api_key.as_deref().filter(|k| !k.is_empty()) {
        match (
            HeaderValue::from_str(key),
            HeaderValue::from_str(&format!("Bearer {}", key)),
        ) {
            (Ok(api_key), Ok(bearer)) => {
                headers.insert("x-api-key", api_key);
                headers.insert(header::AUTHORIZATION, bearer);
            }
            _ => tracing::warn!(node = %route.node.name, "Node api key is not a valid header value"),
        }
    }
    headers
}

/// Upstream response headers safe to hand to the client
fn response_headers(upstream: &HeaderMap, node_name: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH || name == header::CONTENT_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(node_name) {
        headers.insert(PROXY_NODE_HEADER, value);
    }
    headers
}

fn error_body(kind: &str, message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": { "type": kind, "message": message }
    }))
}

fn core_error_response(err: &CoreError) -> Response {
    match err {
        CoreError::NoActiveNode => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
        CoreError::PayloadTooLarge { .. } => {
            (err.status_code(), error_body("request_too_large", &err.to_string())).into_response()
        }
        CoreError::BadRequest(_) => {
            (err.status_code(), error_body("invalid_request_error", &err.to_string())).into_response()
        }
        _ => (err.status_code(), error_body("proxy_error", &err.to_string())).into_response(),
    }
}

/// Collect a body of at most `limit` bytes.
///
/// Going over the limit is `PayloadTooLarge`; any other read failure (an
/// aborted upload, broken chunked framing) is `BadRequest`.
async fn collect_limited(body: Body, limit: usize) -> Result<Bytes, CoreError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::debug!(error = %e, "Failed to read request body");
            CoreError::BadRequest(format!("failed to read request body: {}", e))
        })?;
        if buf.len() + chunk.len() > limit {
            return Err(CoreError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn elapsed_between(from: Instant, to: Option<Instant>) -> Option<Duration> {
    to.map(|t| t.saturating_duration_since(from))
}

/// Proxy request handler
pub struct ProxyHandler {
    state: ProxyState,
}

impl ProxyHandler {
    pub fn new(state: ProxyState) -> Self {
        Self { state }
    }

    /// Handle an incoming request
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(str::to_string);

        tracing::debug!(method = %parts.method, path = %path, query = ?query, "Processing request");

        if is_reserved_path(&path) {
            return StatusCode::NOT_FOUND.into_response();
        }

        let Some(account_id) = self.authenticate(&parts.headers) else {
            tracing::debug!(path = %path, "Rejected request without a known proxy key");
            return (
                StatusCode::UNAUTHORIZED,
                error_body("authentication_error", "invalid or missing proxy api key"),
            )
                .into_response();
        };

        let route = match self.state.control.active_target(&account_id) {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(account = %account_id, error = %e, "No route for request");
                return core_error_response(&e);
            }
        };

        let body = match self.read_body(&parts.headers, body).await {
            Ok(body) => body,
            Err(e) => return core_error_response(&e),
        };
        let body = self.prepare_body(&parts.method, &parts.headers, body);

        let outbound = OutboundRequest {
            method: parts.method.clone(),
            url: route.node.target_url(&path, query.as_deref()),
            headers: outbound_headers(&parts.headers, &route),
            body,
        };

        tracing::debug!(
            account = %route.account_id,
            node = %route.node.name,
            url = %outbound.url,
            retries = route.retries,
            "Forwarding request"
        );

        match self.state.transport.send(&outbound, route.retries).await {
            Ok(Dispatch::Live { response, attempts }) => {
                if attempts > 1 {
                    tracing::info!(node = %route.node.name, attempts, "Upstream answered after retries");
                }
                self.relay(route, parts.method, response, start)
            }
            Ok(Dispatch::Exhausted(failure)) => {
                self.record_failure(&route, 502, failure.message());
                failure.into_response()
            }
            Err(e) => {
                let message = e.to_string();
                self.record_failure(&route, 502, message.clone());
                let mut response =
                    (StatusCode::BAD_GATEWAY, error_body("proxy_error", &message)).into_response();
                if let Ok(value) = HeaderValue::from_str(&message) {
                    response.headers_mut().insert(RETRY_ERROR_HEADER, value);
                }
                response
            }
        }
    }

    /// Account owning the first presented key that resolves, else the
    /// configured fallback
    fn authenticate(&self, headers: &HeaderMap) -> Option<String> {
        extract_proxy_keys(headers)
            .into_iter()
            .find_map(|key| self.state.control.resolve_by_proxy_key(key))
            .or_else(|| self.state.fallback_account.clone())
    }

    /// Buffer the request body, enforcing the size cap while reading
    async fn read_body(&self, headers: &HeaderMap, body: Body) -> Result<Bytes, CoreError> {
        let limit = self.state.config.proxy.max_body_bytes;
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(CoreError::PayloadTooLarge { limit });
        }
        collect_limited(body, limit).await
    }

    /// Log and sanitize JSON request bodies
    fn prepare_body(&self, method: &Method, headers: &HeaderMap, body: Bytes) -> Bytes {
        if !matches!(*method, Method::POST | Method::PUT) || body.is_empty() {
            return body;
        }
        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_json_content_type);
        if !is_json {
            return body;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
                tracing::debug!("{}", format_request_log(&json));
            }
        }

        let (body, changed) = sanitize_tools(&body);
        if changed {
            tracing::debug!(bytes = body.len(), "Sanitized tool definitions");
        }
        body
    }

    fn record_failure(&self, route: &Route, status: u16, message: String) {
        let outcome = RequestOutcome {
            status,
            retry_error: Some(message),
            ..Default::default()
        };
        self.state.control.record_outcome(&route.node.id, &outcome);
    }

    /// Stream the upstream response back and settle its outcome once the body ends
    fn relay(&self, route: Route, method: Method, upstream: reqwest::Response, start: Instant) -> Response {
        let status = upstream.status();
        let headers = response_headers(upstream.headers(), &route.node.name);
        let header_usage = usage_from_headers(upstream.headers());

        let bodiless = method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let body = if bodiless {
            let usage = header_usage.unwrap_or_default();
            let outcome = RequestOutcome {
                status: status.as_u16(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                ..Default::default()
            };
            self.state.control.record_outcome(&route.node.id, &outcome);
            Body::empty()
        } else {
            let control = self.state.control.clone();
            let capture_limit = self.state.config.proxy.capture_bytes;
            let upstream_status = status.as_u16();
            let node_id = route.node.id.clone();
            let node_name = route.node.name.clone();

            let on_finish = move |summary: StreamSummary| {
                let usage = header_usage.unwrap_or_else(|| extract_usage(&summary.capture));
                let (status, retry_error) = match summary.end {
                    StreamEnd::Complete => (upstream_status, None),
                    StreamEnd::Error => (502, Some("upstream stream error".to_string())),
                    StreamEnd::Cancelled => (CLIENT_CLOSED_STATUS, Some("client disconnected".to_string())),
                };
                let outcome = RequestOutcome {
                    status,
                    retry_error,
                    bytes: summary.bytes,
                    first_byte: elapsed_between(start, summary.first_at),
                    stream: summary
                        .first_at
                        .and_then(|first| elapsed_between(first, summary.last_at)),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                };
                tracing::debug!("{}", format_outcome_log(&node_name, &outcome, start.elapsed()));
                control.record_outcome(&node_id, &outcome);
            };

            Body::from_stream(MeteredStream::new(upstream.bytes_stream(), capture_limit, on_finish))
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Node;
    use std::sync::Arc;

    fn route_for(api_key: Option<&str>) -> Route {
        let node = Node::new(
            "acct",
            "primary",
            "https://upstream.example:8443/base",
            api_key.map(str::to_string),
            1,
        )
        .unwrap();
        Route {
            account_id: "acct".to_string(),
            retries: 3,
            node: Arc::new(node),
        }
    }

    #[test]
    fn test_reserved_paths() {
        for path in ["/admin/", "/admin", "/api/nodes", "/login", "/logout", "/version", "/changelog", "/static/app.js", "/favicon.ico"] {
            assert!(is_reserved_path(path), "{}", path);
        }
        for path in ["/v1/messages", "/hello", "/loginx", "/administer", "/", "/versions"] {
            assert!(!is_reserved_path(path), "{}", path);
        }
    }

    #[test]
    fn test_extract_proxy_keys() {
        let mut headers = HeaderMap::new();
        assert!(extract_proxy_keys(&headers).is_empty());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-bearer"));
        assert_eq!(extract_proxy_keys(&headers), vec!["sk-bearer"]);

        headers.insert("x-api-key", HeaderValue::from_static("sk-header"));
        assert_eq!(extract_proxy_keys(&headers), vec!["sk-header", "sk-bearer"]);

        headers.insert("x-api-key", HeaderValue::from_static("sk-bearer"));
        assert_eq!(extract_proxy_keys(&headers), vec!["sk-bearer"]);

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_proxy_keys(&basic).is_empty());
    }

    #[test]
    fn test_outbound_headers_with_node_key() {
        let mut client = HeaderMap::new();
        client.insert("x-api-key", HeaderValue::from_static("sk-client"));
        client.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        client.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        client.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        client.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br"));
        client.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        client.insert("proxy-authorization", HeaderValue::from_static("x"));

        let out = outbound_headers(&client, &route_for(Some("sk-up")));
        assert_eq!(out["x-api-key"], "sk-up");
        assert_eq!(out[header::AUTHORIZATION], "Bearer sk-up");
        assert_eq!(out[header::HOST], "upstream.example:8443");
        assert_eq!(out["anthropic-version"], "2023-06-01");
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert!(out.get(header::ACCEPT_ENCODING).is_none());
        assert!(out.get("proxy-authorization").is_none());
    }

    #[test]
    fn test_outbound_headers_without_node_key_forward_client_auth() {
        let mut client = HeaderMap::new();
        client.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-client"));
        let out = outbound_headers(&client, &route_for(None));
        assert_eq!(out[header::AUTHORIZATION], "Bearer sk-client");
        assert!(out.get("x-api-key").is_none());
    }

    #[test]
    fn test_response_headers_are_filtered() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let out = response_headers(&upstream, "primary");
        assert_eq!(out[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(out[PROXY_NODE_HEADER], "primary");
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert!(out.get(header::CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_collect_limited_tells_errors_apart() {
        let body = collect_limited(Body::from("hello"), 5).await.unwrap();
        assert_eq!(&body[..], b"hello");

        let err = collect_limited(Body::from("hello!"), 5).await.unwrap_err();
        assert_eq!(err, CoreError::PayloadTooLarge { limit: 5 });

        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"par")),
            Err(std::io::Error::other("connection reset")),
        ];
        let err = collect_limited(Body::from_stream(futures::stream::iter(chunks)), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)), "{:?}", err);
        assert_eq!(core_error_response(&err).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_no_active_node_is_plain_503() {
        let response = core_error_response(&CoreError::NoActiveNode);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
