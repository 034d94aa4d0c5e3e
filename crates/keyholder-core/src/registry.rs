//! Device registry.
//!
//! One map of device id to [`DeviceEntry`], fed by the mDNS listener and the
//! BLE scanner, probed by the health monitor and read by the forwarder and the
//! provisioning engine. [`Registry`] is cheap to clone; every clone shares the
//! same map.
//!
//! Readers always get owned copies ([`Registry::get`], [`Registry::snapshot`]),
//! so a round of health probes can iterate while entries are evicted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::bluetooth::PeripheralHandle;

/// Provisioning state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    /// Announced over mDNS and reachable over HTTP.
    Ready,
    /// Seen over BLE only, waiting for credentials.
    Unprovisioned,
}

/// One known device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeviceEntry {
    /// Transport-qualified id, `mdns:<instance>` or `ble:<address>`.
    #[schema(example = "mdns:keyholder-3f2a")]
    pub id: String,
    /// Display name.
    #[schema(example = "Keyholder")]
    pub name: String,
    /// Provisioning state.
    pub state: ProvisioningState,
    /// IP literal or host name (ready entries).
    #[schema(example = "192.168.1.40")]
    pub address: Option<String>,
    /// HTTP port (ready entries).
    #[schema(example = 8080)]
    pub port: Option<u16>,
    /// MAC address when the transport reports one.
    pub mac: Option<String>,
    /// Last sighting, probe success or forwarded exchange.
    pub last_seen: DateTime<Utc>,
    /// Consecutive failed health probes.
    pub failures: u32,
    /// BLE peripheral to connect to (unprovisioned entries).
    #[serde(skip)]
    pub peripheral: Option<PeripheralHandle>,
}

impl DeviceEntry {
    /// Whether commands may be forwarded to this entry.
    #[must_use]
    pub fn is_forwardable(&self) -> bool {
        self.state == ProvisioningState::Ready && self.address.is_some() && self.port.is_some()
    }
}

/// A sighting reported by a discovery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Transport-qualified id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Provisioning state implied by the transport.
    pub state: ProvisioningState,
    /// Address, if the transport resolves one.
    pub address: Option<String>,
    /// Port, if the transport resolves one.
    pub port: Option<u16>,
    /// MAC, if known.
    pub mac: Option<String>,
    /// BLE handle, if any.
    pub peripheral: Option<PeripheralHandle>,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry created.
    Inserted,
    /// Address or port changed.
    Updated,
    /// Only the timestamp (and BLE handle) moved.
    Refreshed,
}

/// Result of recording a failed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Failure counted, still below the threshold.
    Strike(u32),
    /// Threshold reached; the entry was removed.
    Evicted,
    /// The entry was already gone.
    Gone,
}

/// Shared device registry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<HashMap<String, DeviceEntry>>>,
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a sighting.
    ///
    /// Address and port are only written when they differ; `last_seen` is
    /// always refreshed. New entries start with zero failures.
    pub async fn upsert(&self, sighting: Sighting) -> UpsertOutcome {
        self.upsert_at(sighting, Utc::now()).await
    }

    async fn upsert_at(&self, sighting: Sighting, now: DateTime<Utc>) -> UpsertOutcome {
        let mut entries = self.entries.write().await;

        let entry = match entries.entry(sighting.id.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                info!(
                    device_id = %sighting.id,
                    state = ?sighting.state,
                    address = ?sighting.address,
                    port = ?sighting.port,
                    "device discovered"
                );
                vacant.insert(DeviceEntry {
                    id: sighting.id,
                    name: sighting.name,
                    state: sighting.state,
                    address: sighting.address,
                    port: sighting.port,
                    mac: sighting.mac,
                    last_seen: now,
                    failures: 0,
                    peripheral: sighting.peripheral,
                });
                return UpsertOutcome::Inserted;
            }
        };

        entry.last_seen = now;
        if sighting.peripheral.is_some() {
            entry.peripheral = sighting.peripheral;
        }
        if sighting.mac.is_some() && entry.mac != sighting.mac {
            entry.mac = sighting.mac;
        }

        let mut changed = false;
        if sighting.address.is_some() && entry.address != sighting.address {
            entry.address = sighting.address;
            changed = true;
        }
        if sighting.port.is_some() && entry.port != sighting.port {
            entry.port = sighting.port;
            changed = true;
        }

        if changed {
            info!(
                device_id = %entry.id,
                address = ?entry.address,
                port = ?entry.port,
                "device address changed"
            );
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Refreshed
        }
    }

    /// Copy of one entry.
    pub async fn get(&self, id: &str) -> Option<DeviceEntry> {
        self.entries.read().await.get(id).cloned()
    }

    /// Copy of every entry, sorted by id.
    pub async fn snapshot(&self) -> Vec<DeviceEntry> {
        let mut all: Vec<DeviceEntry> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Copy of every forwardable entry.
    pub async fn ready_entries(&self) -> Vec<DeviceEntry> {
        self.snapshot()
            .await
            .into_iter()
            .filter(DeviceEntry::is_forwardable)
            .collect()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Refresh `last_seen`. Returns false if the entry is gone.
    pub async fn touch(&self, id: &str) -> bool {
        self.entries
            .write()
            .await
            .get_mut(id)
            .map(|entry| entry.last_seen = Utc::now())
            .is_some()
    }

    /// Remove an entry.
    pub async fn remove(&self, id: &str) -> Option<DeviceEntry> {
        let removed = self.entries.write().await.remove(id);
        if removed.is_some() {
            debug!(device_id = %id, "device removed from registry");
        }
        removed
    }

    /// Reset the strike counter and refresh `last_seen`.
    pub async fn record_probe_success(&self, id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            if entry.failures > 0 {
                debug!(device_id = %id, previous = entry.failures, "device recovered");
            }
            entry.failures = 0;
            entry.last_seen = Utc::now();
        }
    }

    /// Count a failed probe and evict once `threshold` is reached.
    pub async fn record_probe_failure(&self, id: &str, threshold: u32) -> ProbeVerdict {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return ProbeVerdict::Gone;
        };

        entry.failures += 1;
        if entry.failures < threshold {
            return ProbeVerdict::Strike(entry.failures);
        }

        entries.remove(id);
        info!(device_id = %id, strikes = threshold, "device evicted after failed probes");
        ProbeVerdict::Evicted
    }

    /// Evict every entry not seen within `window`. Returns the evicted ids.
    pub async fn prune_stale(&self, window: Duration) -> Vec<String> {
        self.prune_stale_at(Utc::now(), window).await
    }

    async fn prune_stale_at(&self, now: DateTime<Utc>, window: Duration) -> Vec<String> {
        let mut entries = self.entries.write().await;

        let stale: Vec<String> = entries
            .values()
            .filter(|entry| {
                now.signed_duration_since(entry.last_seen)
                    .to_std()
                    .is_ok_and(|age| age > window)
            })
            .map(|entry| entry.id.clone())
            .collect();
        for id in &stale {
            entries.remove(id);
            info!(device_id = %id, "stale device pruned");
        }
        stale
    }
}
