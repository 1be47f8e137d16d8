//! Bounded retry around one upstream round-trip

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{BackoffKind, RetryConfig};

/// Bytes of a failed response kept for diagnostics
pub const PREVIEW_LIMIT: usize = 4 * 1024;

pub const RETRY_ERROR_HEADER: &str = "x-retry-error";
pub const UPSTREAM_STATUS_HEADER: &str = "x-upstream-status";

/// Fully buffered outbound request, re-sendable on every attempt
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Result of a dispatch that produced at least one upstream response
#[derive(Debug)]
pub enum Dispatch {
    /// A 200, or a status that is not eligible for retry, streamed as is
    Live {
        response: reqwest::Response,
        attempts: u32,
    },
    /// Every attempt ended in a retryable status (or a transport error)
    Exhausted(RetryFailure),
}

/// Diagnostics of the last upstream response after retries ran out
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub upstream_status: u16,
    pub upstream_body: String,
    pub attempts: u32,
}

impl RetryFailure {
    pub fn message(&self) -> String {
        format!(
            "upstream returned {} after {} attempt{}",
            self.upstream_status,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" }
        )
    }

    pub fn body_json(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "type": "proxy_error",
            "message": self.message(),
            "upstream_status": self.upstream_status,
            "retries": self.attempts,
        });
        if !self.upstream_body.is_empty() {
            error["upstream_body"] = serde_json::Value::String(self.upstream_body.clone());
        }
        serde_json::json!({ "error": error })
    }
}

impl IntoResponse for RetryFailure {
    fn into_response(self) -> Response {
        let body = self.body_json().to_string();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = StatusCode::BAD_GATEWAY;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.message()) {
            headers.insert(RETRY_ERROR_HEADER, value);
        }
        headers.insert(UPSTREAM_STATUS_HEADER, HeaderValue::from(self.upstream_status));
        response
    }
}

/// No upstream response was ever received
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("upstream unreachable after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("upstream deadline of {}s exceeded after {attempts} attempts", .deadline.as_secs())]
    Deadline { deadline: Duration, attempts: u32 },
}

/// Delay before attempt `attempt + 1`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    match config.backoff {
        BackoffKind::Linear => Duration::from_millis(config.step_ms.saturating_mul(u64::from(attempt))),
        BackoffKind::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            let ceiling = config.base_ms.saturating_mul(1u64 << shift).min(config.cap_ms);
            Duration::from_millis(fastrand::u64(0..=ceiling))
        }
    }
}

/// Retrying HTTP transport over the shared upstream client
#[derive(Clone)]
pub struct RetryTransport {
    client: reqwest::Client,
    config: RetryConfig,
    per_attempt: Duration,
}

impl RetryTransport {
    pub fn new(client: reqwest::Client, config: RetryConfig, per_attempt: Duration) -> Self {
        Self {
            client,
            config,
            per_attempt,
        }
    }

    /// Send `request` up to `attempts` times.
    ///
    /// The per-attempt timeout bounds only the wait for response headers; the
    /// whole loop is bounded by `attempts × per_attempt`. A live response body
    /// is never cut by either.
    pub async fn send(
        &self,
        request: &OutboundRequest,
        attempts: u32,
    ) -> Result<Dispatch, TransportError> {
        let attempts = attempts.max(1);
        let deadline_len = self.per_attempt.saturating_mul(attempts);
        let deadline = Instant::now() + deadline_len;

        let mut last_failure: Option<RetryFailure> = None;
        let mut last_transport = String::new();
        let mut made = 0;

        for attempt in 1..=attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            made = attempt;

            let send = self
                .client
                .request(request.method.clone(), &request.url)
                .headers(request.headers.clone())
                .body(request.body.clone())
                .send();

            match tokio::time::timeout(self.per_attempt.min(remaining), send).await {
                Err(_) => {
                    last_transport = format!("no response headers within {}s", self.per_attempt.as_secs());
                    tracing::debug!(attempt, url = %request.url, "Upstream attempt timed out");
                }
                Ok(Err(e)) => {
                    last_transport = e.to_string();
                    tracing::debug!(attempt, url = %request.url, error = %e, "Upstream attempt failed");
                }
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    if status == 200 || !self.config.should_retry(status) {
                        return Ok(Dispatch::Live { response, attempts: attempt });
                    }
                    let preview = read_preview(response, remaining).await;
                    tracing::debug!(
                        attempt,
                        status,
                        url = %request.url,
                        preview = %preview,
                        "Retryable upstream status"
                    );
                    last_failure = Some(RetryFailure {
                        upstream_status: status,
                        upstream_body: preview,
                        attempts: attempt,
                    });
                }
            }

            if attempt < attempts {
                let delay = backoff_delay(&self.config, attempt);
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(delay.min(remaining)).await;
            }
        }

        if let Some(mut failure) = last_failure {
            failure.attempts = made;
            tracing::warn!(
                status = failure.upstream_status,
                attempts = made,
                url = %request.url,
                "Upstream retries exhausted"
            );
            return Ok(Dispatch::Exhausted(failure));
        }

        if made < attempts && Instant::now() >= deadline {
            tracing::warn!(attempts = made, url = %request.url, "Upstream dispatch deadline exceeded");
            return Err(TransportError::Deadline {
                deadline: deadline_len,
                attempts: made,
            });
        }

        tracing::warn!(attempts = made, url = %request.url, error = %last_transport, "Upstream unreachable");
        Err(TransportError::Exhausted {
            attempts: made,
            message: last_transport,
        })
    }
}

/// Read at most `PREVIEW_LIMIT` bytes of a body, then drop the connection
async fn read_preview(mut response: reqwest::Response, budget: Duration) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let read = async {
        while buf.len() < PREVIEW_LIMIT {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = (PREVIEW_LIMIT - buf.len()).min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                Ok(None) | Err(_) => break,
            }
        }
    };
    let _ = tokio::time::timeout(budget, read).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(150));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = RetryConfig {
            backoff: BackoffKind::Exponential,
            base_ms: 50,
            cap_ms: 300,
            ..Default::default()
        };
        for attempt in 1..30 {
            let delay = backoff_delay(&config, attempt);
            assert!(delay <= Duration::from_millis(300), "attempt {}", attempt);
        }
        for _ in 0..100 {
            assert!(backoff_delay(&config, 1) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_failure_body_shape() {
        let failure = RetryFailure {
            upstream_status: 503,
            upstream_body: "overloaded".to_string(),
            attempts: 3,
        };
        let body = failure.body_json();
        assert_eq!(body["error"]["type"], "proxy_error");
        assert_eq!(body["error"]["upstream_status"], 503);
        assert_eq!(body["error"]["upstream_body"], "overloaded");
        assert_eq!(body["error"]["retries"], 3);
        assert_eq!(body["error"]["message"], "upstream returned 503 after 3 attempts");
    }

    #[test]
    fn test_failure_response_headers() {
        let failure = RetryFailure {
            upstream_status: 502,
            upstream_body: String::new(),
            attempts: 1,
        };
        assert!(failure.body_json()["error"].get("upstream_body").is_none());

        let response = failure.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[UPSTREAM_STATUS_HEADER], "502");
        assert_eq!(
            response.headers()[RETRY_ERROR_HEADER],
            "upstream returned 502 after 1 attempt"
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_transport_error() {
        let config = RetryConfig {
            step_ms: 1,
            ..Default::default()
        };
        let transport = RetryTransport::new(reqwest::Client::new(), config, Duration::from_secs(2));
        let request = OutboundRequest {
            method: reqwest::Method::GET,
            // Port 9 (discard) on loopback is closed in test environments
            url: "http://127.0.0.1:9/".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let err = transport.send(&request, 2).await.unwrap_err();
        assert!(matches!(err, TransportError::Exhausted { attempts: 2, .. }), "{:?}", err);
    }
}
