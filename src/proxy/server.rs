//! Main proxy server implementation

use anyhow::Context;
use axum::{
    routing::{any, get},
    extract::State,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handler::ProxyHandler;
use super::retry::RetryTransport;
use crate::bootstrap::Bootstrapped;
use crate::config::{AppConfig, UpstreamConfig};
use crate::control::ControlPlane;
use crate::health::HealthProber;

/// Shared state for the proxy
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<AppConfig>,
    pub control: ControlPlane,
    pub transport: RetryTransport,
    /// Account serving requests without a known proxy key
    pub fallback_account: Option<String>,
}

impl ProxyState {
    pub fn new(
        config: Arc<AppConfig>,
        control: ControlPlane,
        client: reqwest::Client,
        fallback_account: Option<String>,
    ) -> Self {
        let transport = RetryTransport::new(
            client,
            config.retry.clone(),
            config.upstream.per_attempt_timeout(),
        );
        Self {
            config,
            control,
            transport,
            fallback_account,
        }
    }
}

/// Build the shared upstream client with TLS configuration.
///
/// No overall request timeout is set: it would cut long SSE bodies. The
/// retry transport bounds the wait for headers instead.
pub fn build_upstream_client(upstream: &UpstreamConfig) -> anyhow::Result<reqwest::Client> {
    let mut client_builder = reqwest::Client::builder()
        .connect_timeout(upstream.connect_timeout())
        .pool_max_idle_per_host(upstream.pool_max_idle_per_host);

    if let Some(ref tls) = upstream.tls {
        if tls.accept_invalid_certs {
            client_builder = client_builder.danger_accept_invalid_certs(true);
            tracing::warn!("TLS: Accepting invalid certificates (use only for development/testing)");
        }

        if let Some(ref ca_path) = tls.ca_cert_path {
            let ca_cert = std::fs::read(ca_path)
                .with_context(|| format!("reading CA certificate {}", ca_path))?;
            let ca_cert = reqwest::Certificate::from_pem(&ca_cert)?;
            client_builder = client_builder.add_root_certificate(ca_cert);
            tracing::info!(path = %ca_path, "TLS: Loaded custom CA certificate");
        }

        // mTLS needs both halves
        if let (Some(cert_path), Some(key_path)) = (&tls.client_cert_path, &tls.client_key_path) {
            let cert_pem = std::fs::read(cert_path)
                .with_context(|| format!("reading client certificate {}", cert_path))?;
            let key_pem = std::fs::read(key_path)
                .with_context(|| format!("reading client key {}", key_path))?;

            let identity = reqwest::Identity::from_pem(&[cert_pem, key_pem].concat())?;
            client_builder = client_builder.identity(identity);
            tracing::info!(path = %cert_path, "TLS: Loaded client certificate for mTLS");
        }
    }

    Ok(client_builder.build()?)
}

/// Router serving `/version` and proxying everything else
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/version", get(version_handler))
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .fallback(proxy_handler)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the proxy server until Ctrl-C or SIGTERM, then drain and flush
pub async fn run_server(config: AppConfig, boot: Bootstrapped) -> anyhow::Result<()> {
    let client = build_upstream_client(&config.upstream)?;
    let config = Arc::new(config);
    let state = ProxyState::new(
        config.clone(),
        boot.control.clone(),
        client.clone(),
        boot.fallback_account.clone(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let prober = HealthProber::new(boot.control.clone(), client, config.health.clone());
    let prober_task = tokio::spawn(prober.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let stats = boot.control.stats();
    tracing::info!(
        %addr,
        accounts = stats.accounts,
        nodes = stats.nodes,
        failed = stats.failed,
        "failover-proxy listening"
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, stopping health prober");
    let _ = shutdown_tx.send(true);
    if let Err(e) = prober_task.await {
        tracing::warn!(error = %e, "Health prober task ended abnormally");
    }

    boot.control.mirror().flush().await;
    tracing::info!("Registry flushed to store");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn version_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn proxy_handler(State(state): State<ProxyState>, req: axum::extract::Request) -> axum::response::Response {
    ProxyHandler::new(state).handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> ProxyState {
        ProxyState::new(
            Arc::new(AppConfig::with_port(8066)),
            ControlPlane::ephemeral(),
            reqwest::Client::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_version_route() {
        let response = build_router(test_state())
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "failover-proxy");
    }

    #[tokio::test]
    async fn test_unknown_key_without_fallback_is_401() {
        let response = build_router(test_state())
            .oneshot(
                Request::get("/v1/messages")
                    .header("x-api-key", "sk-nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reserved_prefix_is_404() {
        let response = build_router(test_state())
            .oneshot(Request::get("/admin/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_account_without_nodes_is_503() {
        let state = test_state();
        state
            .control
            .create_account(crate::control::NewAccount::new("empty", "sk-empty"))
            .unwrap();
        let response = build_router(state)
            .oneshot(
                Request::get("/hello")
                    .header("authorization", "Bearer sk-empty")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"no active upstream node");
    }
}
