//! HTTP reverse proxy

mod handler;
pub mod retry;
pub mod sanitize;
pub mod server;
mod streaming;
pub mod usage;

pub use handler::{extract_proxy_keys, is_reserved_path, ProxyHandler, PROXY_NODE_HEADER};
pub use retry::{backoff_delay, Dispatch, OutboundRequest, RetryFailure, RetryTransport, TransportError};
pub use server::{build_router, build_upstream_client, run_server, ProxyState};
pub use streaming::{MeteredStream, StreamEnd, StreamSummary};
