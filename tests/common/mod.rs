//! In-process mock upstreams and a proxy served on an ephemeral port
//!
//! Tests queue canned responses on a mock before each request and read back
//! what the mock received.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{HeaderMap, Request},
    response::Response,
    Router,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use failover_proxy::config::AppConfig;
use failover_proxy::control::{ControlPlane, NewAccount, NodeSpec};
use failover_proxy::proxy::{build_router, ProxyState};
use failover_proxy::registry::AccountConfig;

/// A canned upstream response
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
    /// Wait before sending anything
    pub header_delay: Option<Duration>,
    /// Send the first `n` body bytes, then the rest after the delay
    pub stall: Option<(usize, Duration)>,
}

impl MockResponse {
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: body.to_string(),
            headers: Vec::new(),
            header_delay: None,
            stall: None,
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self {
            content_type: "application/json".to_string(),
            ..Self::text(status, body)
        }
    }

    pub fn sse(body: &str) -> Self {
        Self {
            content_type: "text/event-stream".to_string(),
            ..Self::text(200, body)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.header_delay = Some(delay);
        self
    }

    pub fn stalled_after(mut self, bytes: usize, delay: Duration) -> Self {
        self.stall = Some((bytes, delay));
        self
    }
}

/// What the mock saw
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReceivedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

struct MockState {
    /// Echo prefix used when nothing is queued and no default is set
    name: String,
    queue: Mutex<VecDeque<MockResponse>>,
    default: Mutex<Option<MockResponse>>,
    received: Mutex<Vec<ReceivedRequest>>,
}

#[derive(Clone)]
pub struct MockUpstream {
    pub url: String,
    state: Arc<MockState>,
}

impl MockUpstream {
    /// Start a mock that answers `<name>:<path>` unless told otherwise
    pub async fn start(name: &str) -> Self {
        let state = Arc::new(MockState {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            default: Mutex::new(None),
            received: Mutex::new(Vec::new()),
        });
        let app = Router::new().fallback(handle_any).with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    /// Queue a response for the next request
    pub fn push(&self, response: MockResponse) {
        self.state.queue.lock().unwrap().push_back(response);
    }

    /// Answer every unqueued request with `response`
    pub fn set_default(&self, response: MockResponse) {
        *self.state.default.lock().unwrap() = Some(response);
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.state.received.lock().unwrap().len()
    }
}

async fn handle_any(State(state): State<Arc<MockState>>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, 10 * 1024 * 1024).await.unwrap_or_default();
    let path = parts.uri.path().to_string();

    let mock = {
        state.received.lock().unwrap().push(ReceivedRequest {
            method: parts.method.to_string(),
            path: path.clone(),
            headers: parts.headers,
            body,
        });
        let queued = state.queue.lock().unwrap().pop_front();
        queued.or_else(|| state.default.lock().unwrap().clone())
    };
    let mock = mock.unwrap_or_else(|| MockResponse::text(200, &format!("{}:{}", state.name, path)));
    if let Some(delay) = mock.header_delay {
        tokio::time::sleep(delay).await;
    }

    let mut builder = Response::builder()
        .status(mock.status)
        .header("Content-Type", &mock.content_type);
    for (name, value) in &mock.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body = match mock.stall {
        None => Body::from(mock.body),
        Some((split, delay)) => {
            let mut head = Bytes::from(mock.body);
            let tail = head.split_off(split.min(head.len()));
            let first = stream::once(async move { Ok::<_, std::io::Error>(head) });
            let rest = stream::once(async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(tail)
            });
            Body::from_stream(first.chain(rest))
        }
    };
    builder.body(body).unwrap()
}

/// The proxy router served on an ephemeral port
pub struct TestProxy {
    pub url: String,
    pub control: ControlPlane,
    pub client: reqwest::Client,
}

impl TestProxy {
    pub async fn start(control: ControlPlane, fallback_account: Option<String>) -> Self {
        let mut config = AppConfig::with_port(8066);
        config.retry.step_ms = 5;
        config.upstream.per_attempt_timeout_seconds = 5;
        Self::start_with_config(control, config, fallback_account).await
    }

    pub async fn start_with_config(
        control: ControlPlane,
        config: AppConfig,
        fallback_account: Option<String>,
    ) -> Self {
        let state = ProxyState::new(Arc::new(config), control.clone(), reqwest::Client::new(), fallback_account);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{}", addr),
            control,
            client: reqwest::Client::new(),
        }
    }

    pub fn get(&self, path: &str, key: &str) -> reqwest::RequestBuilder {
        self.client.get(format!("{}{}", self.url, path)).header("x-api-key", key)
    }

    pub fn post_json(&self, path: &str, key: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.url, path))
            .header("x-api-key", key)
            .json(body)
    }
}

/// Account `tenant` with proxy key `sk-tenant`
pub fn tenant(control: &ControlPlane, config: AccountConfig) -> String {
    let mut new = NewAccount::new("tenant", "sk-tenant");
    new.config = config;
    control.create_account(new).unwrap().id
}

pub fn add_node(control: &ControlPlane, account: &str, name: &str, url: &str, weight: u32) -> String {
    let id = control
        .add_node(account, NodeSpec::new(name, url, weight))
        .unwrap()
        .id
        .clone();
    // Distinct created_at for deterministic tie-breaks
    std::thread::sleep(Duration::from_millis(2));
    id
}

pub fn active_id(control: &ControlPlane, account: &str) -> Option<String> {
    control.snapshot(account).unwrap().active_id
}

/// Poll `cond` until it holds, for up to two seconds
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
