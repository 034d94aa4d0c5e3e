//! # keyholder-server
//!
//! HTTP server library for the keyholder control surface.
//!
//! This library provides the API handlers, application state and logging
//! setup. The `keyholder-server` binary wires them to the discovery and
//! health subsystems from `keyholder-core`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
