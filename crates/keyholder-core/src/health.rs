//! Active health probing and staleness pruning.
//!
//! [`HealthMonitor`] probes every ready device with `GET /status` once per
//! interval. Probes run concurrently, each under its own timeout, and the
//! round waits for all of them, so one slow device never delays the others.
//! A success clears the strike counter; the third consecutive failure evicts
//! the entry at once.
//!
//! [`StalenessPruner`] is the slower backstop: it evicts anything that no
//! listener, probe or forwarded command has touched within the window.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::forwarder::device_url;
use crate::registry::{DeviceEntry, ProbeVerdict, Registry};

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Devices probed.
    pub probed: usize,
    /// Devices that answered.
    pub healthy: usize,
    /// Devices that failed but stay registered.
    pub struck: usize,
    /// Devices evicted this round.
    pub evicted: Vec<String>,
}

/// Periodic liveness prober.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    registry: Registry,
    client: reqwest::Client,
    interval: Duration,
    probe_timeout: Duration,
    threshold: u32,
}

impl HealthMonitor {
    /// Monitor configured from `config`.
    #[must_use]
    pub fn new(registry: Registry, client: reqwest::Client, config: &HealthConfig) -> Self {
        Self {
            registry,
            client,
            interval: config.interval(),
            probe_timeout: config.probe_timeout(),
            threshold: config.failure_threshold,
        }
    }

    async fn probe(&self, entry: DeviceEntry) -> (String, bool) {
        let (Some(address), Some(port)) = (entry.address.as_deref(), entry.port) else {
            return (entry.id, false);
        };
        let url = device_url(address, port, "/status");
        let alive = matches!(
            tokio::time::timeout(self.probe_timeout, self.client.get(&url).send()).await,
            Ok(Ok(response)) if response.status().is_success()
        );
        (entry.id, alive)
    }

    /// Probe every ready entry once.
    pub async fn run_round(&self) -> RoundReport {
        let entries = self.registry.ready_entries().await;
        let mut report = RoundReport {
            probed: entries.len(),
            ..RoundReport::default()
        };

        let results = join_all(entries.into_iter().map(|entry| self.probe(entry))).await;

        for (id, alive) in results {
            if alive {
                self.registry.record_probe_success(&id).await;
                report.healthy += 1;
                continue;
            }
            match self.registry.record_probe_failure(&id, self.threshold).await {
                ProbeVerdict::Strike(strikes) => {
                    warn!(device_id = %id, strikes, "health probe failed");
                    report.struck += 1;
                }
                ProbeVerdict::Evicted => report.evicted.push(id),
                ProbeVerdict::Gone => debug!(device_id = %id, "probe result for removed device"),
            }
        }
        report
    }

    /// Probe on every interval until the task is aborted.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold = self.threshold,
            "health monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.run_round().await;
            if report.probed > 0 {
                debug!(
                    probed = report.probed,
                    healthy = report.healthy,
                    evicted = report.evicted.len(),
                    "health round finished"
                );
            }
        }
    }
}

/// Backstop eviction of entries nobody has touched.
#[derive(Debug, Clone)]
pub struct StalenessPruner {
    registry: Registry,
    interval: Duration,
    window: Duration,
}

impl StalenessPruner {
    /// Pruner configured from `config`.
    #[must_use]
    pub const fn new(registry: Registry, config: &HealthConfig) -> Self {
        Self {
            registry,
            interval: config.prune_interval(),
            window: config.stale_after(),
        }
    }

    /// Prune on every interval until the task is aborted.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pruned = self.registry.prune_stale(self.window).await;
            if !pruned.is_empty() {
                debug!(count = pruned.len(), "staleness pruner evicted devices");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ProvisioningState, Sighting};
    use axum::routing::get;
    use axum::Router;

    async fn spawn_alive() -> u16 {
        let app = Router::new().route("/status", get(|| async { "{}" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn sighting(id: &str, port: u16) -> Sighting {
        Sighting {
            id: id.to_string(),
            name: "Keyholder".to_string(),
            state: ProvisioningState::Ready,
            address: Some("127.0.0.1".to_string()),
            port: Some(port),
            mac: None,
            peripheral: None,
        }
    }

    fn monitor(registry: Registry) -> HealthMonitor {
        let config = HealthConfig {
            probe_timeout_ms: 300,
            ..HealthConfig::default()
        };
        HealthMonitor::new(registry, reqwest::Client::new(), &config)
    }

    #[tokio::test]
    async fn test_three_failed_rounds_evict_only_the_dead_device() {
        let registry = Registry::new();
        registry.upsert(sighting("mdns:alive", spawn_alive().await)).await;
        registry.upsert(sighting("mdns:dead", dead_port())).await;
        let monitor = monitor(registry.clone());

        let first = monitor.run_round().await;
        assert_eq!(first.probed, 2);
        assert_eq!(first.healthy, 1);
        assert_eq!(first.struck, 1);
        assert_eq!(registry.get("mdns:dead").await.unwrap().failures, 1);

        monitor.run_round().await;
        let third = monitor.run_round().await;
        assert_eq!(third.evicted, vec!["mdns:dead".to_string()]);
        assert!(registry.get("mdns:dead").await.is_none());
        assert_eq!(registry.get("mdns:alive").await.unwrap().failures, 0);
    }

    #[tokio::test]
    async fn test_unprovisioned_entries_are_not_probed() {
        let registry = Registry::new();
        registry
            .upsert(Sighting {
                state: ProvisioningState::Unprovisioned,
                address: None,
                port: None,
                ..sighting("ble:AA", 0)
            })
            .await;

        let report = monitor(registry.clone()).run_round().await;
        assert_eq!(report.probed, 0);
        assert!(registry.get("ble:AA").await.is_some());
    }
}
