//! Device management API endpoints.
//!
//! Lists the registry, provisions BLE sightings and relays management
//! commands to ready devices. Relayed calls answer with the device's own
//! status code and JSON body.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use utoipa::ToSchema;

use keyholder_core::{
    DeviceCommand, DeviceDetails, DeviceEntry, KeyholderError, LogLine, ProvisioningError,
    ProvisioningReport, ProvisioningRequest, WifiCredentials,
};

use crate::api::error::{ApiError, ApiJson, ApiResult};
use crate::state::AppState;

/// Creates the devices router. Session routes are nested by the caller.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_devices))
        .route("/{id}/provision", post(provision_device))
        .route("/{id}/update-wifi", post(update_wifi))
        .route("/{id}/factory-reset", post(factory_reset))
        .route("/{id}/log", get(get_log))
        .route("/{id}/details", get(get_details))
        .route("/{id}/health", get(get_health))
        .route("/{id}/keepalive", post(keepalive))
}

/// A device's answer, relayed as-is.
pub type Relayed = (StatusCode, Json<Value>);

/// Forward `command` and relay the device's answer.
pub(crate) async fn relay(state: &AppState, id: &str, command: DeviceCommand) -> ApiResult<Relayed> {
    let reply = state.forwarder().forward(id, &command).await?;
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    Ok((status, Json(reply.data)))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Proxy-side view of a device's liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "mdns:keyholder-3f2a",
    "healthy": true,
    "failures": 0,
    "last_seen": "2026-01-15T03:30:00Z"
}))]
pub struct DeviceHealth {
    /// Device id.
    pub device_id: String,
    /// Whether the device answered a status probe just now.
    pub healthy: bool,
    /// Consecutive failed background probes.
    pub failures: u32,
    /// Last sighting, probe success or forwarded exchange.
    pub last_seen: DateTime<Utc>,
}

// ============================================================================
// Handlers
// ============================================================================

/// List known devices.
#[utoipa::path(
    get,
    path = "/devices",
    tag = "devices",
    operation_id = "listDevices",
    summary = "List discovered devices",
    description = "Returns every device currently in the registry, ready devices found over \
        mDNS and unprovisioned devices found over BLE, sorted by id.",
    responses(
        (status = 200, description = "Registry snapshot", body = Vec<DeviceEntry>)
    )
)]
pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceEntry>> {
    Json(state.registry().snapshot().await)
}

/// Provision an unprovisioned device over BLE.
#[utoipa::path(
    post,
    path = "/devices/{id}/provision",
    tag = "devices",
    operation_id = "provisionDevice",
    summary = "Provision a device over Bluetooth",
    description = "Writes Wi-Fi credentials and feature flags to a `ble:` device. On success \
        the entry is removed; the device reboots and reappears under an `mdns:` id.",
    params(("id" = String, Path, description = "Device id", example = "ble:AA:BB:CC:DD:EE:FF")),
    request_body = ProvisioningRequest,
    responses(
        (status = 200, description = "Device provisioned", body = ProvisioningReport),
        (status = 400, description = "Invalid field", body = crate::api::error::ErrorResponse),
        (status = 404, description = "Not an unprovisioned device", body = crate::api::error::ErrorResponse),
        (status = 422, description = "Connection or write failed", body = crate::api::error::ErrorResponse),
        (status = 503, description = "No Bluetooth on this host", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn provision_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<ProvisioningRequest>,
) -> ApiResult<Json<ProvisioningReport>> {
    let provisioner = state
        .provisioner()
        .ok_or_else(|| ApiError::from(ProvisioningError::NoBluetooth))?;
    let report = provisioner.provision(&id, &request).await?;
    info!(device_id = %id, "provisioned over BLE");
    Ok(Json(report))
}

/// Push new Wi-Fi credentials to a ready device.
#[utoipa::path(
    post,
    path = "/devices/{id}/update-wifi",
    tag = "devices",
    operation_id = "updateDeviceWifi",
    summary = "Change a device's Wi-Fi network",
    params(("id" = String, Path, description = "Device id")),
    request_body = WifiCredentials,
    responses(
        (status = 200, description = "Device accepted the credentials"),
        (status = 400, description = "Invalid credentials", body = crate::api::error::ErrorResponse),
        (status = 404, description = "Unknown device", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn update_wifi(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(credentials): ApiJson<WifiCredentials>,
) -> ApiResult<Relayed> {
    credentials
        .check()
        .map_err(|(field, message)| KeyholderError::Validation(format!("{field} {message}")))?;
    relay(&state, &id, DeviceCommand::UpdateWifi(credentials)).await
}

/// Factory-reset a device.
#[utoipa::path(
    post,
    path = "/devices/{id}/factory-reset",
    tag = "devices",
    operation_id = "factoryResetDevice",
    summary = "Factory-reset a device",
    description = "Clears stats, rewards and features. The device reboots mid-response, so a \
        timeout is reported as `202` with `{\"rebooting\": true}`.",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device reset"),
        (status = 202, description = "Device is rebooting"),
        (status = 404, description = "Unknown device", body = crate::api::error::ErrorResponse),
        (status = 409, description = "Session in progress", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn factory_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::FactoryReset).await
}

/// Read a device's event log.
#[utoipa::path(
    get,
    path = "/devices/{id}/log",
    tag = "devices",
    operation_id = "getDeviceLog",
    summary = "Read the device event log",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Recent events, oldest first", body = Vec<LogLine>),
        (status = 404, description = "Unknown device", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_log(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::Log).await
}

/// Read a device's static details.
#[utoipa::path(
    get,
    path = "/devices/{id}/details",
    tag = "devices",
    operation_id = "getDeviceDetails",
    summary = "Read device details",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device details", body = DeviceDetails),
        (status = 404, description = "Unknown device", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::Details).await
}

/// Probe a device once and report its registry health.
#[utoipa::path(
    get,
    path = "/devices/{id}/health",
    tag = "devices",
    operation_id = "getDeviceHealth",
    summary = "Check device liveness",
    description = "Sends one status probe. An unreachable device is reported as \
        `healthy: false` rather than an error; the strike counter is left to the \
        background monitor.",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Liveness view", body = DeviceHealth),
        (status = 404, description = "Unknown device", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeviceHealth>> {
    let healthy = match state.forwarder().forward(&id, &DeviceCommand::Status).await {
        Ok(_) => true,
        Err(KeyholderError::Unreachable(_)) => false,
        Err(e) => return Err(e.into()),
    };
    let entry = state
        .registry()
        .get(&id)
        .await
        .ok_or_else(|| KeyholderError::NotFound(id.clone()))?;

    Ok(Json(DeviceHealth {
        device_id: entry.id,
        healthy,
        failures: entry.failures,
        last_seen: entry.last_seen,
    }))
}

/// Send a keepalive to a device.
#[utoipa::path(
    post,
    path = "/devices/{id}/keepalive",
    tag = "devices",
    operation_id = "keepaliveDevice",
    summary = "Feed the session watchdog",
    description = "A locked session aborts if no keepalive arrives within the watchdog window.",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Keepalive accepted"),
        (status = 404, description = "Unknown device", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn keepalive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::Keepalive).await
}
