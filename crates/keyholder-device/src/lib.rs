//! # keyholder-device
//!
//! Reference keyholder device: the lock session state machine behind the
//! device-facing HTTP API, announced over mDNS.
//!
//! - [`runtime`] - Session machine, phase ticker, persistence
//! - [`api`] - Device-facing routes
//! - [`event_log`] - Bounded event log served by `GET /log`

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod event_log;
pub mod runtime;

pub use runtime::{DeviceIdentity, DeviceRuntime};
