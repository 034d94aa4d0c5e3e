//! mDNS discovery using mdns-sd.
//!
//! Provisioned devices register `_keyholder._tcp.local.` with optional `name`
//! and `mac` TXT properties. The proxy browses for that type and upserts a
//! ready registry entry per resolved service.
//!
//! Some devices join the network without announcing themselves, so on every
//! sweep interval the browse is stopped and started again to force a fresh
//! query. Goodbye packets (`ServiceRemoved`) are ignored on purpose: a
//! transient radio drop should not make a device flicker out of the list.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, trace, warn};

use crate::registry::{ProvisioningState, Registry, Sighting, UpsertOutcome};

/// TXT property carrying the display name.
pub const PROP_NAME: &str = "name";
/// TXT property carrying the MAC address.
pub const PROP_MAC: &str = "mac";
/// TXT property carrying the firmware version.
pub const PROP_VERSION: &str = "version";

/// Build a ready sighting from a resolved service.
///
/// The id is `mdns:<instance>`. IPv4 addresses are preferred over IPv6.
/// Returns `None` when the service has no address or belongs to another type.
#[must_use]
pub fn sighting_from_resolved(info: &ServiceInfo, service_type: &str) -> Option<Sighting> {
    let instance = info
        .get_fullname()
        .strip_suffix(service_type)?
        .trim_end_matches('.');
    if instance.is_empty() {
        return None;
    }

    let addresses = info.get_addresses();
    let address: IpAddr = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()?;

    Some(Sighting {
        id: format!("mdns:{instance}"),
        name: info
            .get_property_val_str(PROP_NAME)
            .filter(|name| !name.is_empty())
            .unwrap_or(instance)
            .to_string(),
        state: ProvisioningState::Ready,
        address: Some(address.to_string()),
        port: Some(info.get_port()),
        mac: info
            .get_property_val_str(PROP_MAC)
            .filter(|mac| !mac.is_empty())
            .map(str::to_string),
        peripheral: None,
    })
}

/// Register a device on mDNS. Returns the full service name.
///
/// # Errors
///
/// Returns an error if the service info is invalid or the daemon refuses it.
pub fn register_service(
    daemon: &ServiceDaemon,
    service_type: &str,
    instance: &str,
    port: u16,
    name: &str,
    mac: Option<&str>,
) -> Result<String> {
    let mut properties = HashMap::new();
    properties.insert(PROP_NAME.to_string(), name.to_string());
    properties.insert(
        PROP_VERSION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Some(mac) = mac {
        properties.insert(PROP_MAC.to_string(), mac.to_string());
    }

    let service = ServiceInfo::new(
        service_type,
        instance,
        &format!("{instance}.local."),
        "",
        port,
        properties,
    )
    .context("create mDNS service info")?
    .enable_addr_auto();

    let fullname = service.get_fullname().to_string();
    daemon.register(service).context("register mDNS service")?;
    info!(service = %fullname, port, "mDNS service registered");
    Ok(fullname)
}

/// Browses for ready devices and keeps the registry fed.
pub struct MdnsListener {
    daemon: ServiceDaemon,
    registry: Registry,
    service_type: String,
    sweep_interval: Duration,
}

impl MdnsListener {
    /// Listener with its own mDNS daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be started.
    pub fn new(registry: Registry, service_type: &str, sweep_interval: Duration) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("start mDNS daemon")?;
        Ok(Self {
            daemon,
            registry,
            service_type: service_type.to_string(),
            sweep_interval,
        })
    }

    fn browse(&self) -> Option<Receiver<ServiceEvent>> {
        match self.daemon.browse(&self.service_type) {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                warn!(error = %e, service_type = %self.service_type, "mDNS browse failed");
                None
            }
        }
    }

    /// Run until the task is aborted.
    pub async fn run(self) {
        let mut receiver = self.browse();
        info!(
            service_type = %self.service_type,
            sweep_secs = self.sweep_interval.as_secs(),
            "mDNS listener started"
        );

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    if let Err(e) = self.daemon.stop_browse(&self.service_type) {
                        debug!(error = %e, "stop_browse before sweep");
                    }
                    receiver = self.browse();
                    debug!("mDNS radar sweep");
                }
                event = next_event(receiver.as_ref()) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("mDNS browse channel closed; waiting for next sweep");
                        receiver = None;
                    }
                },
            }
        }
    }

    async fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(sighting) = sighting_from_resolved(&info, &self.service_type) else {
                    debug!(service = %info.get_fullname(), "resolved service has no usable address");
                    return;
                };
                let id = sighting.id.clone();
                match self.registry.upsert(sighting).await {
                    UpsertOutcome::Inserted | UpsertOutcome::Updated => {}
                    UpsertOutcome::Refreshed => trace!(device_id = %id, "mDNS refresh"),
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                debug!(service = %fullname, "mDNS goodbye ignored");
            }
            other => trace!(event = ?other, "mDNS event"),
        }
    }
}

async fn next_event(receiver: Option<&Receiver<ServiceEvent>>) -> Option<ServiceEvent> {
    match receiver {
        Some(receiver) => receiver.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}
