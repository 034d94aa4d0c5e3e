//! Bluetooth Low Energy central abstraction.
//!
//! This module provides:
//! - [`BleCentral`]: advertisement scanning and connecting to peripherals
//! - [`GattLink`]: an open connection that can resolve a service and write
//!   characteristics
//! - [`BluerCentral`]: the BlueZ implementation (feature `bluetooth`, Linux)
//! - [`MockCentral`]: an in-memory central for tests and non-Linux builds
//!   (feature `mock-bluetooth`, or whenever `bluetooth` is off)
//!
//! UUIDs cross this boundary as strings and are compared through
//! [`normalize_uuid`], so `{0000FFE0-...}` and `0000ffe0...` are the same id.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Bluetooth errors.
#[derive(Debug, Error)]
pub enum BleError {
    /// No adapter on this host.
    #[error("no Bluetooth adapter found")]
    AdapterNotFound,

    /// The adapter exists but is switched off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// A peripheral address could not be parsed.
    #[error("invalid Bluetooth address '{address}'")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// The adapter does not know this peripheral.
    #[error("peripheral {address} not found")]
    PeripheralNotFound {
        /// Peripheral address.
        address: String,
    },

    /// A GATT operation failed.
    #[error("GATT {operation} failed: {message}")]
    Gatt {
        /// What was attempted.
        operation: &'static str,
        /// Underlying error text.
        message: String,
    },

    /// Any other stack error.
    #[error("Bluetooth error: {message}")]
    Internal {
        /// Underlying error text.
        message: String,
    },
}

/// Result alias for Bluetooth operations.
pub type BleResult<T> = Result<T, BleError>;

/// Non-owning reference to a peripheral: its address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle {
    address: String,
}

impl PeripheralHandle {
    /// Handle for the peripheral at `address`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Peripheral address, e.g. `AA:BB:CC:DD:EE:FF`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// One advertisement seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Where it came from.
    pub peripheral: PeripheralHandle,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<String>,
}

impl Advertisement {
    /// Whether the advertisement lists `service`.
    #[must_use]
    pub fn advertises(&self, service: &str) -> bool {
        let wanted = normalize_uuid(service);
        self.services.iter().any(|s| normalize_uuid(s) == wanted)
    }
}

/// Lowercase hex digits only, so UUID spellings compare equal.
#[must_use]
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A BLE central role.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start discovery and stream advertisements until the stream is dropped.
    async fn advertisements(&self) -> BleResult<BoxStream<'static, Advertisement>>;

    /// Open a connection to `peripheral`.
    async fn connect(&self, peripheral: &PeripheralHandle) -> BleResult<Box<dyn GattLink>>;
}

/// An open GATT connection.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Resolve `service` and return the UUIDs of all its characteristics.
    /// An absent service yields an empty list.
    async fn characteristics(&mut self, service: &str) -> BleResult<Vec<String>>;

    /// Write `value` to a characteristic returned by [`Self::characteristics`].
    async fn write(&mut self, characteristic: &str, value: &[u8]) -> BleResult<()>;

    /// Close the connection.
    async fn disconnect(&mut self) -> BleResult<()>;
}

#[cfg(feature = "bluetooth")]
pub use bluez::BluerCentral;

#[cfg(feature = "bluetooth")]
mod bluez {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use bluer::gatt::remote::Characteristic;
    use bluer::{Adapter, AdapterEvent, Address, Device, Session};
    use futures::stream::{BoxStream, StreamExt};
    use tracing::{debug, info};

    use super::{
        normalize_uuid, Advertisement, BleCentral, BleError, BleResult, GattLink,
        PeripheralHandle,
    };

    fn internal(e: &bluer::Error) -> BleError {
        BleError::Internal {
            message: e.to_string(),
        }
    }

    fn gatt(operation: &'static str, e: &bluer::Error) -> BleError {
        BleError::Gatt {
            operation,
            message: e.to_string(),
        }
    }

    /// BlueZ central on the default adapter.
    pub struct BluerCentral {
        _session: Session,
        adapter: Adapter,
    }

    impl BluerCentral {
        /// Open a BlueZ session and pick the default adapter.
        ///
        /// # Errors
        ///
        /// [`BleError::AdapterNotFound`] without an adapter,
        /// [`BleError::AdapterPoweredOff`] if it is off.
        pub async fn new() -> BleResult<Self> {
            let session = Session::new().await.map_err(|e| internal(&e))?;
            let adapter = session
                .default_adapter()
                .await
                .map_err(|_| BleError::AdapterNotFound)?;
            if !adapter.is_powered().await.map_err(|e| internal(&e))? {
                return Err(BleError::AdapterPoweredOff);
            }
            info!(adapter = %adapter.name(), "Bluetooth adapter ready");
            Ok(Self {
                _session: session,
                adapter,
            })
        }

        fn device(&self, peripheral: &PeripheralHandle) -> BleResult<Device> {
            let address: Address =
                peripheral
                    .address()
                    .parse()
                    .map_err(|_| BleError::InvalidAddress {
                        address: peripheral.address().to_string(),
                    })?;
            self.adapter
                .device(address)
                .map_err(|_| BleError::PeripheralNotFound {
                    address: peripheral.address().to_string(),
                })
        }
    }

    async fn describe(adapter: Adapter, address: Address) -> Option<Advertisement> {
        let device = adapter.device(address).ok()?;
        let services = device
            .uuids()
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .map(|uuid| uuid.to_string())
            .collect();
        Some(Advertisement {
            peripheral: PeripheralHandle::new(address.to_string()),
            name: device.name().await.ok().flatten(),
            rssi: device.rssi().await.ok().flatten(),
            services,
        })
    }

    #[async_trait]
    impl BleCentral for BluerCentral {
        async fn advertisements(&self) -> BleResult<BoxStream<'static, Advertisement>> {
            let events = self
                .adapter
                .discover_devices()
                .await
                .map_err(|e| internal(&e))?;
            let adapter = self.adapter.clone();
            let stream = events.filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    match event {
                        AdapterEvent::DeviceAdded(address) => describe(adapter, address).await,
                        _ => None,
                    }
                }
            });
            Ok(stream.boxed())
        }

        async fn connect(&self, peripheral: &PeripheralHandle) -> BleResult<Box<dyn GattLink>> {
            let device = self.device(peripheral)?;
            if !device.is_connected().await.map_err(|e| internal(&e))? {
                device.connect().await.map_err(|e| gatt("connect", &e))?;
            }
            debug!(peripheral = %peripheral.address(), "connected");
            Ok(Box::new(BluerLink {
                device,
                characteristics: HashMap::new(),
            }))
        }
    }

    struct BluerLink {
        device: Device,
        characteristics: HashMap<String, Characteristic>,
    }

    #[async_trait]
    impl GattLink for BluerLink {
        async fn characteristics(&mut self, service: &str) -> BleResult<Vec<String>> {
            let wanted = normalize_uuid(service);
            let services = self
                .device
                .services()
                .await
                .map_err(|e| gatt("service discovery", &e))?;

            for candidate in services {
                let uuid = candidate.uuid().await.map_err(|e| gatt("service uuid", &e))?;
                if normalize_uuid(&uuid.to_string()) != wanted {
                    continue;
                }
                let mut found = Vec::new();
                for characteristic in candidate
                    .characteristics()
                    .await
                    .map_err(|e| gatt("characteristic discovery", &e))?
                {
                    let uuid = characteristic
                        .uuid()
                        .await
                        .map_err(|e| gatt("characteristic uuid", &e))?
                        .to_string();
                    self.characteristics
                        .insert(normalize_uuid(&uuid), characteristic);
                    found.push(uuid);
                }
                return Ok(found);
            }
            Ok(Vec::new())
        }

        async fn write(&mut self, characteristic: &str, value: &[u8]) -> BleResult<()> {
            let target = self
                .characteristics
                .get(&normalize_uuid(characteristic))
                .ok_or_else(|| BleError::Gatt {
                    operation: "write",
                    message: format!("characteristic {characteristic} was not resolved"),
                })?;
            target.write(value).await.map_err(|e| gatt("write", &e))
        }

        async fn disconnect(&mut self) -> BleResult<()> {
            self.device
                .disconnect()
                .await
                .map_err(|e| gatt("disconnect", &e))
        }
    }
}

#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use mock::{MockCentral, MockWrite};

#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use async_trait::async_trait;
    use futures::stream::{self, BoxStream, StreamExt};
    use tokio::sync::broadcast;

    use super::{
        normalize_uuid, Advertisement, BleCentral, BleError, BleResult, GattLink,
        PeripheralHandle,
    };

    /// One characteristic write recorded by [`MockCentral`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockWrite {
        /// Peripheral address.
        pub peripheral: String,
        /// Characteristic UUID as written.
        pub characteristic: String,
        /// Bytes written.
        pub value: Vec<u8>,
    }

    #[derive(Debug, Default)]
    struct Peripheral {
        service: String,
        characteristics: Vec<String>,
        fail_on: Option<String>,
    }

    #[derive(Debug, Default)]
    struct State {
        peripherals: HashMap<String, Peripheral>,
        writes: Vec<MockWrite>,
        connects: usize,
        disconnects: usize,
    }

    /// In-memory central. Clones share state.
    #[derive(Debug, Clone)]
    pub struct MockCentral {
        state: Arc<Mutex<State>>,
        adverts: broadcast::Sender<Advertisement>,
    }

    impl Default for MockCentral {
        fn default() -> Self {
            let (adverts, _) = broadcast::channel(64);
            Self {
                state: Arc::default(),
                adverts,
            }
        }
    }

    impl MockCentral {
        /// Central with no peripherals.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Register a connectable peripheral exposing `characteristics` under `service`.
        pub fn add_peripheral(&self, address: &str, service: &str, characteristics: &[&str]) {
            self.state().peripherals.insert(
                address.to_string(),
                Peripheral {
                    service: service.to_string(),
                    characteristics: characteristics.iter().map(ToString::to_string).collect(),
                    fail_on: None,
                },
            );
        }

        /// Make writes to `characteristic` on `address` fail.
        pub fn fail_writes_to(&self, address: &str, characteristic: &str) {
            if let Some(peripheral) = self.state().peripherals.get_mut(address) {
                peripheral.fail_on = Some(normalize_uuid(characteristic));
            }
        }

        /// Push an advertisement to every open scan stream.
        pub fn advertise(&self, advertisement: Advertisement) {
            // No receivers just means nobody is scanning.
            let _ = self.adverts.send(advertisement);
        }

        /// Number of open scan streams.
        #[must_use]
        pub fn scanners(&self) -> usize {
            self.adverts.receiver_count()
        }

        /// Every successful write so far.
        #[must_use]
        pub fn writes(&self) -> Vec<MockWrite> {
            self.state().writes.clone()
        }

        /// Connections opened so far.
        #[must_use]
        pub fn connects(&self) -> usize {
            self.state().connects
        }

        /// Connections closed so far.
        #[must_use]
        pub fn disconnects(&self) -> usize {
            self.state().disconnects
        }
    }

    #[async_trait]
    impl BleCentral for MockCentral {
        async fn advertisements(&self) -> BleResult<BoxStream<'static, Advertisement>> {
            let receiver = self.adverts.subscribe();
            let stream = stream::unfold(receiver, |mut receiver| async move {
                loop {
                    match receiver.recv().await {
                        Ok(advertisement) => return Some((advertisement, receiver)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        }

        async fn connect(&self, peripheral: &PeripheralHandle) -> BleResult<Box<dyn GattLink>> {
            let mut state = self.state();
            if !state.peripherals.contains_key(peripheral.address()) {
                return Err(BleError::PeripheralNotFound {
                    address: peripheral.address().to_string(),
                });
            }
            state.connects += 1;
            Ok(Box::new(MockLink {
                central: self.clone(),
                address: peripheral.address().to_string(),
            }))
        }
    }

    struct MockLink {
        central: MockCentral,
        address: String,
    }

    #[async_trait]
    impl GattLink for MockLink {
        async fn characteristics(&mut self, service: &str) -> BleResult<Vec<String>> {
            let state = self.central.state();
            Ok(state
                .peripherals
                .get(&self.address)
                .filter(|p| normalize_uuid(&p.service) == normalize_uuid(service))
                .map(|p| p.characteristics.clone())
                .unwrap_or_default())
        }

        async fn write(&mut self, characteristic: &str, value: &[u8]) -> BleResult<()> {
            let mut state = self.central.state();
            let fails = state
                .peripherals
                .get(&self.address)
                .and_then(|p| p.fail_on.as_deref())
                .is_some_and(|target| target == normalize_uuid(characteristic));
            if fails {
                return Err(BleError::Gatt {
                    operation: "write",
                    message: "injected failure".to_string(),
                });
            }
            state.writes.push(MockWrite {
                peripheral: self.address.clone(),
                characteristic: characteristic.to_string(),
                value: value.to_vec(),
            });
            Ok(())
        }

        async fn disconnect(&mut self) -> BleResult<()> {
            self.central.state().disconnects += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_normalize_uuid_ignores_format() {
        assert_eq!(
            normalize_uuid("{0000FFE0-0000-1000-8000-00805F9B34FB}"),
            normalize_uuid("0000ffe000001000800000805f9b34fb")
        );
    }

    #[test]
    fn test_advertises_matches_any_spelling() {
        let ad = Advertisement {
            peripheral: PeripheralHandle::new("AA:BB:CC:DD:EE:FF"),
            name: Some("Keyholder".into()),
            rssi: Some(-60),
            services: vec!["0000FFE0-0000-1000-8000-00805F9B34FB".into()],
        };
        assert!(ad.advertises("0000ffe0-0000-1000-8000-00805f9b34fb"));
        assert!(!ad.advertises("0000ffe1-0000-1000-8000-00805f9b34fb"));
    }

    #[tokio::test]
    async fn test_mock_records_writes_and_injected_failures() {
        let central = MockCentral::new();
        central.add_peripheral("AA", "svc", &["c1", "c2"]);
        central.fail_writes_to("AA", "c2");

        let mut link = central.connect(&PeripheralHandle::new("AA")).await.unwrap();
        assert_eq!(link.characteristics("SVC").await.unwrap(), vec!["c1", "c2"]);
        assert!(link.characteristics("other").await.unwrap().is_empty());

        link.write("c1", &[1]).await.unwrap();
        assert!(link.write("c2", &[1]).await.is_err());
        link.disconnect().await.unwrap();

        assert_eq!(central.writes().len(), 1);
        assert_eq!((central.connects(), central.disconnects()), (1, 1));
        assert!(central.connect(&PeripheralHandle::new("BB")).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_advertisement_stream() {
        let central = MockCentral::new();
        let mut stream = central.advertisements().await.unwrap();
        assert_eq!(central.scanners(), 1);

        let ad = Advertisement {
            peripheral: PeripheralHandle::new("AA"),
            name: None,
            rssi: None,
            services: vec![],
        };
        central.advertise(ad.clone());
        assert_eq!(stream.next().await, Some(ad));
    }
}
