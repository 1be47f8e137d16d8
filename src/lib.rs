//! failover-proxy: multi-tenant reverse proxy for Anthropic-style LLM APIs
//!
//! Features:
//! - Per-tenant node lists with strict-priority active-node selection
//! - Bounded retries with a structured 502 on exhaustion
//! - Fail-streak tripping and health-probe re-admission
//! - SQLite write-through persistence of nodes, counters and config
//! - Tool-definition sanitizing and token usage metering

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod error;
pub mod health;
pub mod proxy;
pub mod registry;
pub mod stats;
pub mod store;

pub use bootstrap::{bootstrap, bootstrap_with_store, Bootstrapped};
pub use config::AppConfig;
pub use control::ControlPlane;
pub use error::CoreError;
pub use proxy::run_server;
