//! BLE provisioning engine.
//!
//! Hands Wi-Fi credentials and feature flags to an unprovisioned device by
//! writing one GATT characteristic per field, in a fixed order:
//!
//! | # | field | encoding |
//! |---|-------|----------|
//! | 1 | `ssid` | UTF-8 |
//! | 2 | `password` | UTF-8 |
//! | 3 | `enable_streaks` | 1 byte, 0 or 1 |
//! | 4 | `enable_reward_code` | 1 byte |
//! | 5 | `enable_payback` | 1 byte |
//! | 6-9 | `channel_1` .. `channel_4` | 1 byte each |
//! | 10 | `payback_secs` | `u16` little-endian |
//!
//! Every required characteristic is resolved before the first write; if any
//! is missing nothing is written. Scanning is paused for the whole exchange
//! and resumes on every exit path. On success the entry is removed from the
//! registry: the device reboots and comes back over mDNS under a new id.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::bluetooth::{normalize_uuid, BleCentral, BleError, GattLink};
use crate::discovery::{ScanControl, PROVISIONED_QUIET_WINDOW};
use crate::registry::{ProvisioningState, Registry};
use crate::types::{DeviceFeatures, WifiCredentials};

/// Provisioning GATT service.
pub const SERVICE_UUID: &str = "b7a1e000-5c4f-4d0a-9e2b-6b65796f6c64";

/// One provisioning characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningField {
    /// Network SSID.
    Ssid,
    /// WPA passphrase.
    Password,
    /// Streak tracking flag.
    EnableStreaks,
    /// Reward code flag.
    EnableRewardCode,
    /// Payback flag.
    EnablePayback,
    /// Channel 1 enable.
    Channel1,
    /// Channel 2 enable.
    Channel2,
    /// Channel 3 enable.
    Channel3,
    /// Channel 4 enable.
    Channel4,
    /// Payback debt per abort, seconds.
    PaybackSecs,
}

impl ProvisioningField {
    /// Write order.
    pub const ORDER: [Self; 10] = [
        Self::Ssid,
        Self::Password,
        Self::EnableStreaks,
        Self::EnableRewardCode,
        Self::EnablePayback,
        Self::Channel1,
        Self::Channel2,
        Self::Channel3,
        Self::Channel4,
        Self::PaybackSecs,
    ];

    /// Characteristic UUID.
    #[must_use]
    pub const fn uuid(self) -> &'static str {
        match self {
            Self::Ssid => "b7a1e001-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::Password => "b7a1e002-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::EnableStreaks => "b7a1e003-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::EnableRewardCode => "b7a1e004-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::EnablePayback => "b7a1e005-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::Channel1 => "b7a1e006-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::Channel2 => "b7a1e007-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::Channel3 => "b7a1e008-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::Channel4 => "b7a1e009-5c4f-4d0a-9e2b-6b65796f6c64",
            Self::PaybackSecs => "b7a1e00a-5c4f-4d0a-9e2b-6b65796f6c64",
        }
    }

    /// Field name used in errors and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ssid => "ssid",
            Self::Password => "password",
            Self::EnableStreaks => "enable_streaks",
            Self::EnableRewardCode => "enable_reward_code",
            Self::EnablePayback => "enable_payback",
            Self::Channel1 => "channel_1",
            Self::Channel2 => "channel_2",
            Self::Channel3 => "channel_3",
            Self::Channel4 => "channel_4",
            Self::PaybackSecs => "payback_secs",
        }
    }
}

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Unknown id, or the entry is not an unprovisioned BLE sighting.
    #[error("device '{0}' is not waiting for provisioning")]
    NotProvisionable(String),

    /// A request field is invalid.
    #[error("invalid {field}: {message}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What is wrong.
        message: String,
    },

    /// This host has no usable Bluetooth central.
    #[error("Bluetooth is not available on this host")]
    NoBluetooth,

    /// Connecting or resolving the service failed.
    #[error("could not open provisioning connection: {0}")]
    Connect(#[source] BleError),

    /// Required characteristics are absent; nothing was written.
    #[error("device is missing provisioning characteristics: {}", .0.join(", "))]
    MissingCharacteristics(Vec<String>),

    /// A write failed part way through.
    #[error("writing {field} failed: {message}")]
    WriteFailed {
        /// Field being written.
        field: &'static str,
        /// Underlying error text.
        message: String,
    },
}

/// Body of `POST /devices/{id}/provision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningRequest {
    /// Network to join.
    pub wifi: WifiCredentials,
    /// Feature flags, defaults when omitted.
    #[serde(default)]
    pub features: DeviceFeatures,
}

impl ProvisioningRequest {
    /// Validate field lengths.
    ///
    /// # Errors
    ///
    /// [`ProvisioningError::InvalidField`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ProvisioningError> {
        self.wifi
            .check()
            .map_err(|(field, message)| ProvisioningError::InvalidField { field, message })?;
        if self.features.payback && self.features.payback_secs == 0 {
            return Err(ProvisioningError::InvalidField {
                field: "payback_secs",
                message: "must be non-zero when payback is enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Encoded value of every field, in write order.
    #[must_use]
    pub fn encode(&self) -> Vec<(ProvisioningField, Vec<u8>)> {
        let flag = |on: bool| vec![u8::from(on)];
        let channels = self.features.channels;
        ProvisioningField::ORDER
            .iter()
            .map(|&field| {
                let value = match field {
                    ProvisioningField::Ssid => self.wifi.ssid.as_bytes().to_vec(),
                    ProvisioningField::Password => self.wifi.password.as_bytes().to_vec(),
                    ProvisioningField::EnableStreaks => flag(self.features.streaks),
                    ProvisioningField::EnableRewardCode => flag(self.features.reward_code),
                    ProvisioningField::EnablePayback => flag(self.features.payback),
                    ProvisioningField::Channel1 => flag(channels[0]),
                    ProvisioningField::Channel2 => flag(channels[1]),
                    ProvisioningField::Channel3 => flag(channels[2]),
                    ProvisioningField::Channel4 => flag(channels[3]),
                    ProvisioningField::PaybackSecs => {
                        self.features.payback_secs.to_le_bytes().to_vec()
                    }
                };
                (field, value)
            })
            .collect()
    }
}

/// Result of a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProvisioningReport {
    /// The entry that was provisioned (now removed from the registry).
    #[schema(example = "ble:AA:BB:CC:DD:EE:FF")]
    pub device_id: String,
    /// Characteristics written.
    #[schema(example = 10)]
    pub fields_written: usize,
}

/// Runs provisioning against registry entries.
#[derive(Clone)]
pub struct Provisioner {
    central: Arc<dyn BleCentral>,
    registry: Registry,
    scan: ScanControl,
}

impl Provisioner {
    /// Provisioner using `central`, pausing `scan` while connected.
    #[must_use]
    pub fn new(central: Arc<dyn BleCentral>, registry: Registry, scan: ScanControl) -> Self {
        Self {
            central,
            registry,
            scan,
        }
    }

    /// Provision device `id`.
    ///
    /// # Errors
    ///
    /// See [`ProvisioningError`]. On any error after connecting, the link is
    /// closed and the entry stays in the registry.
    pub async fn provision(
        &self,
        id: &str,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningReport, ProvisioningError> {
        request.validate()?;

        let peripheral = self
            .registry
            .get(id)
            .await
            .filter(|entry| entry.state == ProvisioningState::Unprovisioned)
            .and_then(|entry| entry.peripheral)
            .ok_or_else(|| ProvisioningError::NotProvisionable(id.to_string()))?;

        let _pause = self.scan.pause();
        info!(device_id = %id, peripheral = %peripheral.address(), "provisioning started");

        let mut link = self
            .central
            .connect(&peripheral)
            .await
            .map_err(ProvisioningError::Connect)?;

        let outcome = write_fields(link.as_mut(), request).await;
        if let Err(e) = link.disconnect().await {
            warn!(device_id = %id, error = %e, "disconnect after provisioning failed");
        }

        match outcome {
            Ok(fields_written) => {
                // Still advertising until it reboots; keep it out of the
                // registry once scanning resumes.
                self.scan
                    .quiet(peripheral.address(), PROVISIONED_QUIET_WINDOW)
                    .await;
                self.registry.remove(id).await;
                info!(device_id = %id, fields_written, "device provisioned");
                Ok(ProvisioningReport {
                    device_id: id.to_string(),
                    fields_written,
                })
            }
            Err(e) => {
                warn!(device_id = %id, error = %e, "provisioning failed");
                Err(e)
            }
        }
    }
}

async fn write_fields(
    link: &mut dyn GattLink,
    request: &ProvisioningRequest,
) -> Result<usize, ProvisioningError> {
    let available: HashSet<String> = link
        .characteristics(SERVICE_UUID)
        .await
        .map_err(ProvisioningError::Connect)?
        .iter()
        .map(|uuid| normalize_uuid(uuid))
        .collect();

    let missing: Vec<String> = ProvisioningField::ORDER
        .iter()
        .filter(|field| !available.contains(&normalize_uuid(field.uuid())))
        .map(|field| field.name().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ProvisioningError::MissingCharacteristics(missing));
    }

    let fields = request.encode();
    for (field, value) in &fields {
        link.write(field.uuid(), value)
            .await
            .map_err(|e| ProvisioningError::WriteFailed {
                field: field.name(),
                message: e.to_string(),
            })?;
        debug!(field = field.name(), bytes = value.len(), "field written");
    }
    Ok(fields.len())
}
