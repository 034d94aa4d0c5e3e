//! BLE advertisement scanner.
//!
//! Unprovisioned devices advertise the provisioning service. Each matching
//! advertisement inserts or refreshes a `ble:<address>` entry in the
//! registry. Because a BlueZ discovery session reports a device only once,
//! the scan is restarted on every sweep interval.
//!
//! Provisioning needs the radio to itself: [`ScanControl::pause`] returns a
//! guard that stops scanning until it is dropped, on every exit path. A
//! freshly provisioned device keeps advertising until it reboots, so its
//! address is ignored for [`PROVISIONED_QUIET_WINDOW`] afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bluetooth::{Advertisement, BleCentral};
use crate::registry::{ProvisioningState, Registry, Sighting, UpsertOutcome};

const DEFAULT_NAME: &str = "Keyholder";
const STREAM_END_BACKOFF: Duration = Duration::from_secs(1);

/// How long advertisements from a just-provisioned address are ignored.
pub const PROVISIONED_QUIET_WINDOW: Duration = Duration::from_secs(60);

/// Shared pause switch for the scanner. Pauses nest.
#[derive(Debug, Clone)]
pub struct ScanControl {
    pauses: Arc<watch::Sender<usize>>,
    quiet_until: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Default for ScanControl {
    fn default() -> Self {
        let (pauses, _) = watch::channel(0);
        Self {
            pauses: Arc::new(pauses),
            quiet_until: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl ScanControl {
    /// Scanning allowed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop scanning until the returned guard is dropped.
    #[must_use = "scanning resumes as soon as the guard is dropped"]
    pub fn pause(&self) -> ScanPause {
        self.pauses.send_modify(|n| *n += 1);
        debug!("BLE scan pause requested");
        ScanPause {
            pauses: Arc::clone(&self.pauses),
        }
    }

    /// Whether any pause guard is alive.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pauses.borrow() > 0
    }

    /// Ignore advertisements from `address` for `window`.
    pub async fn quiet(&self, address: &str, window: Duration) {
        self.quiet_until
            .lock()
            .await
            .insert(address.to_ascii_uppercase(), Instant::now() + window);
    }

    /// Whether `address` is inside a quiet window. Expired windows are dropped.
    pub async fn is_quiet(&self, address: &str) -> bool {
        let now = Instant::now();
        let mut quiet = self.quiet_until.lock().await;
        quiet.retain(|_, until| *until > now);
        quiet.contains_key(&address.to_ascii_uppercase())
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.pauses.subscribe()
    }
}

/// Keeps the scanner paused while alive.
#[derive(Debug)]
pub struct ScanPause {
    pauses: Arc<watch::Sender<usize>>,
}

impl Drop for ScanPause {
    fn drop(&mut self) {
        self.pauses.send_modify(|n| *n = n.saturating_sub(1));
        debug!("BLE scan pause released");
    }
}

/// Continuous scanner feeding unprovisioned entries into the registry.
pub struct BleScanner {
    central: Arc<dyn BleCentral>,
    registry: Registry,
    control: ScanControl,
    service_uuid: String,
    restart_every: Duration,
}

impl BleScanner {
    /// Scanner for devices advertising `service_uuid`.
    #[must_use]
    pub fn new(
        central: Arc<dyn BleCentral>,
        registry: Registry,
        control: ScanControl,
        service_uuid: &str,
        restart_every: Duration,
    ) -> Self {
        Self {
            central,
            registry,
            control,
            service_uuid: service_uuid.to_string(),
            restart_every,
        }
    }

    /// Run until the task is aborted.
    pub async fn run(self) {
        let mut pauses = self.control.subscribe();

        loop {
            if pauses.wait_for(|n| *n == 0).await.is_err() {
                return;
            }

            let mut adverts = match self.central.advertisements().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "BLE scan could not start");
                    tokio::time::sleep(self.restart_every).await;
                    continue;
                }
            };
            debug!("BLE scan started");

            let restart = tokio::time::sleep(self.restart_every);
            tokio::pin!(restart);

            loop {
                tokio::select! {
                    advert = adverts.next() => match advert {
                        Some(advert) => self.handle(advert).await,
                        None => {
                            tokio::time::sleep(STREAM_END_BACKOFF).await;
                            break;
                        }
                    },
                    changed = pauses.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *pauses.borrow_and_update() > 0 {
                            info!("BLE scan paused");
                            break;
                        }
                    }
                    () = &mut restart => break,
                }
            }
        }
    }

    async fn handle(&self, advert: Advertisement) {
        if !advert.advertises(&self.service_uuid) {
            return;
        }

        let address = advert.peripheral.address().to_string();
        if self.control.is_quiet(&address).await {
            debug!(%address, "ignoring advertisement from provisioned device");
            return;
        }
        let sighting = Sighting {
            id: format!("ble:{address}"),
            name: advert
                .name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_NAME.to_string()),
            state: ProvisioningState::Unprovisioned,
            address: None,
            port: None,
            mac: Some(address),
            peripheral: Some(advert.peripheral),
        };

        if self.registry.upsert(sighting).await == UpsertOutcome::Refreshed {
            debug!(rssi = ?advert.rssi, "BLE advertisement refreshed entry");
        }
    }
}
