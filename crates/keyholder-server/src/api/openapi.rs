//! OpenAPI specification generation for the keyholder control surface.
//!
//! Served at `/openapi.json` and written to the workspace root by the
//! `gen-openapi` binary for client generation.

use axum::Json;
use utoipa::OpenApi;

use keyholder_core::session::{RewardView, Transition};
use keyholder_core::{
    AbortSource, DeviceDetails, DeviceEntry, DeviceFeatures, HealthResponse, LogLine, Phase,
    ProvisioningReport, ProvisioningRequest, ProvisioningState, Reward, SessionConfig,
    SessionStats, SessionStatus, TriggerStrategy, WifiCredentials,
};

use super::devices::DeviceHealth;
use super::error::ErrorResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for keyholder.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "keyholder API",
        version = "0.1.0",
        description = r#"
# keyholder API

Control surface for keyholder lock devices on the local network.

## Overview

1. **Discovery**: devices announce themselves over mDNS once provisioned, and
   advertise a BLE provisioning service before that.
2. **Provisioning**: Wi-Fi credentials and feature flags are written over BLE.
3. **Sessions**: arm, test and abort lock sessions; read status and rewards.

## Session phases

`ready` → `armed` → `locked` → `completed`, with `aborted` (penalty) after a
hard abort and `testing` for a short trial lock. A locked session aborts on
its own when keepalives stop arriving.

## Errors

Every error body is `{"error": <code>, "message": <text>, "details": <json|null>}`.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local keyholder server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "devices", description = "Discovery, provisioning and device management"),
        (name = "session", description = "Lock session lifecycle")
    ),
    paths(
        super::health::health_check,
        super::devices::list_devices,
        super::devices::provision_device,
        super::devices::update_wifi,
        super::devices::factory_reset,
        super::devices::get_log,
        super::devices::get_details,
        super::devices::get_health,
        super::devices::keepalive,
        super::session::get_status,
        super::session::arm,
        super::session::start_test,
        super::session::abort,
        super::session::get_reward,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            DeviceEntry,
            ProvisioningState,
            DeviceHealth,
            DeviceDetails,
            DeviceFeatures,
            LogLine,
            WifiCredentials,
            ProvisioningRequest,
            ProvisioningReport,
            SessionConfig,
            TriggerStrategy,
            SessionStatus,
            SessionStats,
            Phase,
            AbortSource,
            Transition,
            Reward,
            RewardView,
        )
    )
)]
pub struct ApiDoc;
