//! # keyholder-core
//!
//! Core logic for the keyholder lock system.
//!
//! This crate provides:
//! - Device discovery over mDNS and BLE, reconciled into one registry
//! - Health probing with strike-based eviction, plus a staleness backstop
//! - Forwarding of session and management commands to devices over HTTP
//! - BLE provisioning of Wi-Fi credentials and feature flags
//! - The lock session state machine and its reward code generator
//!
//! ## Architecture
//!
//! - [`registry`] - Shared device map and merge rules
//! - [`discovery`] - mDNS radar sweep and BLE advertisement scanner
//! - [`bluetooth`] - BLE central abstraction (BlueZ and in-memory)
//! - [`health`] - Health monitor and staleness pruner
//! - [`forwarder`] - Device-facing HTTP client
//! - [`provisioning`] - Ordered GATT field writes
//! - [`session`] - Session phases, timers, watchdog and stats
//! - [`reward`] - Reward codes and checksums
//! - [`timers`] - Named cancellable background tasks
//! - [`config`] - Layered configuration
//! - [`storage`] - JSON persistence for device state
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared wire types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod bluetooth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod provisioning;
pub mod registry;
pub mod reward;
pub mod session;
pub mod storage;
pub mod timers;
pub mod types;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluerCentral;
#[cfg(any(feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use bluetooth::MockCentral;
pub use bluetooth::{BleCentral, BleError, GattLink, PeripheralHandle};
pub use config::{Config, ConfigError, ConfigResult, SERVICE_TYPE};
pub use discovery::{BleScanner, MdnsListener, ScanControl};
pub use error::{Error, KeyholderError, Result};
pub use forwarder::{DeviceCommand, ForwardReply, Forwarder};
pub use health::{HealthMonitor, StalenessPruner};
pub use provisioning::{ProvisioningError, ProvisioningReport, ProvisioningRequest, Provisioner};
pub use registry::{DeviceEntry, ProvisioningState, Registry, Sighting};
pub use reward::{Reward, RewardHistory};
pub use session::{
    AbortSource, Phase, SessionConfig, SessionError, SessionLimits, SessionMachine, SessionStats,
    SessionStatus, TriggerStrategy,
};
pub use storage::{PersistedDevice, Storage};
pub use timers::TimerSet;
pub use types::{DeviceDetails, DeviceFeatures, HealthResponse, LogLine, WifiCredentials};
