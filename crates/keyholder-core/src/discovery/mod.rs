//! Discovery transports.
//!
//! - [`mdns`]: browses for provisioned devices and performs the periodic
//!   radar sweep; also registers the reference device's own service
//! - [`ble`]: scans for unprovisioned devices advertising the provisioning
//!   service, and can be paused while a provisioning connection is open
//!
//! Both listeners only ever insert or refresh registry entries. Removal is
//! left to the health monitor and the staleness pruner.

pub mod ble;
pub mod mdns;

pub use ble::{BleScanner, ScanControl, ScanPause, PROVISIONED_QUIET_WINDOW};
pub use mdns::{register_service, sighting_from_resolved, MdnsListener};
