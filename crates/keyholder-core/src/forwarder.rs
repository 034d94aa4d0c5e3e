//! Command forwarder.
//!
//! Translates control-surface commands into HTTP calls against the device's
//! resolved address and maps the device's answer back onto
//! [`KeyholderError`]. Every successful exchange refreshes the entry's
//! `last_seen`, which makes normal traffic a passive keepalive.
//!
//! In-flight calls are never cancelled. A late answer for a device that has
//! since been evicted only fails to refresh a missing entry.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{KeyholderError, Result};
use crate::registry::Registry;
use crate::session::SessionConfig;
use crate::types::WifiCredentials;

/// Header carrying a per-request correlation id, echoed in device logs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A command understood by the device-facing API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// `GET /status`
    Status,
    /// `GET /details`
    Details,
    /// `POST /arm`
    Arm(SessionConfig),
    /// `POST /abort`
    Abort,
    /// `POST /start-test`
    StartTest,
    /// `POST /keepalive`
    Keepalive,
    /// `GET /reward`
    Reward,
    /// `GET /log`
    Log,
    /// `POST /update-wifi`
    UpdateWifi(WifiCredentials),
    /// `POST /factory-reset`
    FactoryReset,
}

impl DeviceCommand {
    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> Method {
        match self {
            Self::Status | Self::Details | Self::Reward | Self::Log => Method::GET,
            _ => Method::POST,
        }
    }

    /// Path on the device.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Status => "/status",
            Self::Details => "/details",
            Self::Arm(_) => "/arm",
            Self::Abort => "/abort",
            Self::StartTest => "/start-test",
            Self::Keepalive => "/keepalive",
            Self::Reward => "/reward",
            Self::Log => "/log",
            Self::UpdateWifi(_) => "/update-wifi",
            Self::FactoryReset => "/factory-reset",
        }
    }

    /// Commands after which the device reboots mid-response.
    #[must_use]
    pub const fn reboots_device(&self) -> bool {
        matches!(self, Self::FactoryReset)
    }
}

/// A device's answer to a forwarded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ForwardReply {
    /// HTTP status returned by the device (202 for an assumed reboot).
    #[schema(example = 200)]
    pub status: u16,
    /// JSON body returned by the device, `null` when empty.
    pub data: Value,
}

/// Host part of a device URL. IPv6 literals are bracketed and a zone id's
/// `%` is percent-encoded.
#[must_use]
pub fn format_host(address: &str) -> String {
    if !address.contains(':') {
        return address.to_string();
    }
    let bare = address.trim_start_matches('[').trim_end_matches(']');
    match bare.split_once('%') {
        Some((ip, zone)) => format!("[{ip}%25{zone}]"),
        None => format!("[{bare}]"),
    }
}

/// Full URL of `path` on a device.
#[must_use]
pub fn device_url(address: &str, port: u16, path: &str) -> String {
    format!("http://{}:{port}{path}", format_host(address))
}

fn device_message(body: &Value, status: StatusCode) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map_or_else(|| format!("device answered {status}"), str::to_string)
}

/// Forwards commands to registered devices.
#[derive(Debug, Clone)]
pub struct Forwarder {
    registry: Registry,
    client: reqwest::Client,
    timeout: Duration,
}

impl Forwarder {
    /// Forwarder using `client` with a per-request `timeout`.
    #[must_use]
    pub const fn new(registry: Registry, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            registry,
            client,
            timeout,
        }
    }

    /// Send `command` to device `id`.
    ///
    /// # Errors
    ///
    /// - [`KeyholderError::NotFound`] for unknown or unprovisioned devices, or a device 404
    /// - [`KeyholderError::Busy`] when the device answers 409
    /// - [`KeyholderError::Validation`] when it answers 400 or 422
    /// - [`KeyholderError::Unreachable`] for transport failures and other statuses
    pub async fn forward(&self, id: &str, command: &DeviceCommand) -> Result<ForwardReply> {
        let entry = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| KeyholderError::NotFound(id.to_string()))?;
        let (Some(address), Some(port)) = (entry.address.as_deref(), entry.port) else {
            return Err(KeyholderError::NotFound(id.to_string()));
        };
        if !entry.is_forwardable() {
            return Err(KeyholderError::NotFound(id.to_string()));
        }

        let url = device_url(address, port, command.path());
        let request_id = Uuid::new_v4();
        debug!(device_id = %id, %url, %request_id, method = %command.method(), "forwarding command");

        let request = self
            .client
            .request(command.method(), &url)
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .timeout(self.timeout);
        let request = match command {
            DeviceCommand::Arm(config) => request.json(config),
            DeviceCommand::UpdateWifi(credentials) => request.json(credentials),
            _ => request,
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() && command.reboots_device() => {
                info!(device_id = %id, "no answer to reboot-class command; assuming reboot");
                return Ok(self.assumed_reboot(id).await);
            }
            Err(e) => {
                warn!(device_id = %id, error = %e, "device unreachable");
                return Err(KeyholderError::Unreachable(format!("{id}: {e}")));
            }
        };

        let status = response.status();
        if status == StatusCode::GATEWAY_TIMEOUT && command.reboots_device() {
            info!(device_id = %id, "gateway timeout on reboot-class command; assuming reboot");
            return Ok(self.assumed_reboot(id).await);
        }

        let data = match response.bytes().await {
            Ok(bytes) if bytes.is_empty() => Value::Null,
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
            Err(e) if status.is_success() => {
                return Err(KeyholderError::Unreachable(format!("{id}: {e}")));
            }
            Err(_) => Value::Null,
        };

        if status.is_success() {
            self.registry.touch(id).await;
            return Ok(ForwardReply {
                status: status.as_u16(),
                data,
            });
        }

        let message = device_message(&data, status);
        debug!(device_id = %id, %status, %message, "device rejected command");
        Err(match status {
            StatusCode::CONFLICT => KeyholderError::Busy(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                KeyholderError::Validation(message)
            }
            StatusCode::NOT_FOUND => KeyholderError::NotFound(format!("{id}: {message}")),
            _ => KeyholderError::Unreachable(format!("{id}: {message}")),
        })
    }

    async fn assumed_reboot(&self, id: &str) -> ForwardReply {
        self.registry.touch(id).await;
        ForwardReply {
            status: StatusCode::ACCEPTED.as_u16(),
            data: serde_json::json!({ "rebooting": true }),
        }
    }
}
