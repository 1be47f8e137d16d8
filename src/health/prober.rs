//! Health prober
//!
//! One task per process. Each account is probed on its own `health_every`
//! cadence; only nodes in the account's failed set are contacted. Targets are
//! copied out of the registry under the read lock and every HTTP call runs
//! with the lock released.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

use crate::config::HealthConfig;
use crate::control::{ControlPlane, ProbeTarget};
use crate::registry::ProbeKind;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe returned status {status}")]
    Status { status: u16, elapsed_ms: u64 },

    #[error("probe failed: {0}")]
    Transport(String),

    #[error("probe timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl ProbeError {
    /// Round-trip time, when the node answered at all
    pub fn elapsed_ms(&self) -> Option<u64> {
        match self {
            ProbeError::Status { elapsed_ms, .. } => Some(*elapsed_ms),
            _ => None,
        }
    }
}

/// Send one health probe and return its round-trip time in milliseconds.
///
/// `Messages` posts the smallest valid request to `{url}/v1/messages` and
/// accepts any 2xx. `Head` sends `HEAD {url}` and accepts exactly 200.
pub async fn probe_node(
    client: &reqwest::Client,
    url: &Url,
    api_key: Option<&str>,
    kind: ProbeKind,
    model: &str,
    timeout: Duration,
) -> Result<u64, ProbeError> {
    let request = match kind {
        ProbeKind::Messages => {
            let endpoint = format!("{}/v1/messages", url.as_str().trim_end_matches('/'));
            let mut request = client
                .post(endpoint)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&serde_json::json!({
                    "model": model,
                    "max_tokens": 1,
                    "messages": [{"role": "user", "content": "hi"}],
                }));
            if let Some(key) = api_key {
                request = request.header("x-api-key", key).bearer_auth(key);
            }
            request
        }
        ProbeKind::Head => client.head(url.as_str()),
    };

    let start = Instant::now();
    let response = match tokio::time::timeout(timeout, request.timeout(timeout).send()).await {
        Err(_) => return Err(ProbeError::Timeout(timeout)),
        Ok(Err(e)) if e.is_timeout() => return Err(ProbeError::Timeout(timeout)),
        Ok(Err(e)) => return Err(ProbeError::Transport(e.to_string())),
        Ok(Ok(response)) => response,
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let status = response.status();

    let healthy = match kind {
        ProbeKind::Messages => status.is_success(),
        ProbeKind::Head => status == reqwest::StatusCode::OK,
    };
    if healthy {
        Ok(elapsed_ms)
    } else {
        Err(ProbeError::Status {
            status: status.as_u16(),
            elapsed_ms,
        })
    }
}

/// Counts of one probe round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub probed: usize,
    pub recovered: usize,
    pub promoted: usize,
}

pub struct HealthProber {
    control: ControlPlane,
    client: reqwest::Client,
    config: HealthConfig,
}

impl HealthProber {
    pub fn new(control: ControlPlane, client: reqwest::Client, config: HealthConfig) -> Self {
        Self {
            control,
            client,
            config,
        }
    }

    /// Probe every failed node of `account_ids` concurrently
    pub async fn run_once(&self, account_ids: &[String]) -> ProbeRound {
        let targets = self.control.probe_targets(account_ids);
        if targets.is_empty() {
            return ProbeRound::default();
        }

        let probes = targets.iter().map(|target| self.probe(target));
        let results = futures::future::join_all(probes).await;

        let mut round = ProbeRound {
            probed: targets.len(),
            ..Default::default()
        };
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(ping_ms) => {
                    round.recovered += 1;
                    if self.control.recover_node(&target.node_id, ping_ms) {
                        round.promoted += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        account = %target.account_id,
                        node = %target.name,
                        error = %e,
                        "Node still unhealthy"
                    );
                    self.control
                        .record_probe_failure(&target.node_id, &e.to_string(), e.elapsed_ms());
                }
            }
        }
        round
    }

    async fn probe(&self, target: &ProbeTarget) -> Result<u64, ProbeError> {
        let kind = target.method.resolve(target.api_key.is_some());
        probe_node(
            &self.client,
            &target.url,
            target.api_key.as_deref(),
            kind,
            &self.config.probe_model,
            self.config.probe_timeout(),
        )
        .await
    }

    /// Probe loop; returns once `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Health prober started");
        let mut next_due: HashMap<String, Instant> = HashMap::new();

        loop {
            let now = Instant::now();
            let schedule: HashMap<String, Duration> = self.control.health_schedule().into_iter().collect();

            next_due.retain(|id, _| schedule.contains_key(id));
            for (id, every) in &schedule {
                let due = next_due.entry(id.clone()).or_insert(now + *every);
                // A shortened interval takes effect right away
                if *due > now + *every {
                    *due = now + *every;
                }
            }

            let due: Vec<String> = next_due
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            if !due.is_empty() {
                let round = self.run_once(&due).await;
                if round.probed > 0 {
                    tracing::debug!(
                        accounts = due.len(),
                        probed = round.probed,
                        recovered = round.recovered,
                        promoted = round.promoted,
                        "Health probe round finished"
                    );
                }
                let after = Instant::now();
                for id in due {
                    if let Some(every) = schedule.get(&id) {
                        next_due.insert(id, after + *every);
                    }
                }
            }

            let idle_until = Instant::now() + self.config.idle_poll();
            let wake = next_due.values().min().copied().unwrap_or(idle_until).min(idle_until);

            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Health prober stopped");
    }
}
