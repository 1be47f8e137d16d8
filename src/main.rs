//! failover-proxy: multi-tenant reverse proxy for Anthropic-style LLM APIs
//!
//! Routes each tenant's traffic to its highest-priority healthy upstream,
//! retries transient failures, trips failing nodes, and re-admits them once
//! health probes pass.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use failover_proxy::{
    bootstrap,
    config::AppConfig,
    health::probe_node,
    proxy::build_upstream_client,
    registry::{AccountSnapshot, HealthCheckMethod},
    run_server,
    stats::{format_accounts, OutputFormat},
    store::{rebuild_registry, SqliteStore},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProbeMethod {
    Auto,
    Messages,
    Head,
}

impl From<ProbeMethod> for HealthCheckMethod {
    fn from(method: ProbeMethod) -> Self {
        match method {
            ProbeMethod::Auto => HealthCheckMethod::Auto,
            ProbeMethod::Messages => HealthCheckMethod::Messages,
            ProbeMethod::Head => HealthCheckMethod::Head,
        }
    }
}

#[derive(Parser)]
#[command(name = "failover-proxy")]
#[command(version)]
#[command(about = "Multi-tenant failover reverse proxy for Anthropic-style LLM APIs")]
#[command(long_about = "
failover-proxy sits between LLM clients and a set of interchangeable upstream
endpoints per tenant:
  - Strict-priority routing to the lowest-weight healthy node
  - Retries on 502/503/504 with a structured 502 when they run out
  - Automatic failover after repeated failures, health-probe recovery
  - Per-node request, byte and token counters persisted to SQLite

Example usage:
  failover-proxy run --config config.yaml
  failover-proxy list-nodes --format compact
  failover-proxy probe-node --url https://api.example.com --api-key sk-...
")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Set logging level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Run {
        /// Override listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Override database URL (e.g., "sqlite:///var/lib/failover-proxy.db")
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Validate configuration file
    CheckConfig,

    /// Print every tenant's nodes and counters from the database
    ListNodes {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
        /// Override database URL
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Send one health probe to an upstream
    ProbeNode {
        /// Upstream base URL
        #[arg(long)]
        url: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, value_enum, default_value_t = ProbeMethod::Auto)]
        method: ProbeMethod,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level_filter = if let Some(level) = cli.log_level {
        level.to_string()
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
            .to_string()
    };

    let subscriber = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(&level_filter));
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    match cli.command {
        Commands::Run { port, database_url } => {
            run_proxy(&cli.config, port, database_url).await?;
        }
        Commands::CheckConfig => {
            check_config(&cli.config);
        }
        Commands::ListNodes { format, database_url } => {
            list_nodes(&cli.config, format, database_url).await?;
        }
        Commands::ProbeNode { url, api_key, method } => {
            probe_once(&cli.config, &url, api_key, method.into()).await?;
        }
    }

    Ok(())
}

/// Run the proxy server
async fn run_proxy(
    config_path: &Path,
    port_override: Option<u16>,
    database_url_override: Option<String>,
) -> anyhow::Result<()> {
    let mut config = load_config_or_exit(config_path);

    if let Some(port) = port_override {
        config.server.port = port;
    }
    if let Some(url) = database_url_override {
        config.database.url = url;
    }

    tracing::info!(path = ?config_path, database = %config.database.url, "Loaded configuration");

    let boot = bootstrap(&config).await.context("bootstrap failed")?;
    run_server(config, boot).await
}

/// Validate configuration file
fn check_config(config_path: &Path) {
    match AppConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid\n");
            println!("Server:");
            println!("  Listen: {}:{}", config.server.host, config.server.port);
            println!("\nDatabase:");
            println!("  URL: {}", config.database.url);
            println!("\nUpstream:");
            println!("  Connect timeout: {}s", config.upstream.connect_timeout_seconds);
            println!("  Per-attempt timeout: {}s", config.upstream.per_attempt_timeout_seconds);
            if let Some(ref tls) = config.upstream.tls {
                if tls.accept_invalid_certs {
                    println!("  TLS: Accepting invalid certificates");
                }
                if let Some(ref ca) = tls.ca_cert_path {
                    println!("  TLS CA: {}", ca);
                }
                if let Some(ref cert) = tls.client_cert_path {
                    println!("  TLS Client Cert: {}", cert);
                }
            }
            println!("\nRetry:");
            println!("  Backoff: {:?}", config.retry.backoff);
            println!("  Retry on: {:?}", config.retry.retry_on);
            println!("\nHealth:");
            println!("  Probe timeout: {}s", config.health.probe_timeout_seconds);
            println!("  Probe model: {}", config.health.probe_model);
            println!("\nBootstrap:");
            println!("  Admin: {}", config.bootstrap.admin.name);
            match &config.bootstrap.default_account {
                Some(default) => {
                    println!("  Default account: {} ({} nodes)", default.account_id(), default.nodes.len());
                    for node in &default.nodes {
                        println!("    {} w={} {}", node.name, node.weight, node.url);
                    }
                }
                None => println!("  Default account: none"),
            }
            if let Some(fallback) = config.fallback_account_id() {
                println!("  Fallback account: {}", fallback);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Print nodes from the store without seeding or mutating anything
async fn list_nodes(
    config_path: &Path,
    format: OutputFormat,
    database_url_override: Option<String>,
) -> anyhow::Result<()> {
    let url = match database_url_override {
        Some(url) => url,
        None => load_config_or_exit(config_path).database.url,
    };

    let store = SqliteStore::connect(&url, 1)
        .await
        .with_context(|| format!("opening {}", url))?;
    let rebuilt = rebuild_registry(&store).await?;
    let mut accounts: Vec<AccountSnapshot> = rebuilt.registry.accounts().map(|a| a.snapshot()).collect();
    accounts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    store.close().await;

    if accounts.is_empty() {
        println!("No accounts in {}", url);
        return Ok(());
    }
    println!("{}", format_accounts(&accounts, format));
    Ok(())
}

/// One-off health probe
async fn probe_once(
    config_path: &Path,
    url: &str,
    api_key: Option<String>,
    method: HealthCheckMethod,
) -> anyhow::Result<()> {
    let config = AppConfig::from_file(config_path).unwrap_or_else(|_| AppConfig::with_port(8066));
    let target = failover_proxy::registry::parse_node_url(url)?;
    let api_key = failover_proxy::registry::normalize_api_key(api_key);
    let kind = method.resolve(api_key.is_some());
    let client = build_upstream_client(&config.upstream)?;

    println!("Probing {} ({:?})", target, kind);
    match probe_node(
        &client,
        &target,
        api_key.as_deref(),
        kind,
        &config.health.probe_model,
        config.health.probe_timeout(),
    )
    .await
    {
        Ok(ms) => {
            println!("✓ Healthy ({}ms)", ms);
            Ok(())
        }
        Err(e) => {
            println!("✗ Unhealthy: {}", e);
            std::process::exit(1);
        }
    }
}

/// Load configuration or exit with error
fn load_config_or_exit(config_path: &Path) -> AppConfig {
    match AppConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            eprintln!("\nMake sure you have a config.yaml file.");
            eprintln!("You can copy config.example.yaml and modify it:");
            eprintln!("  cp config.example.yaml config.yaml");
            std::process::exit(1);
        }
    }
}
