//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `devices` - Registry listing, provisioning and device management
//! - `session` - Lock session commands relayed to the device
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod devices;
pub mod error;
pub mod health;
pub mod openapi;
pub mod session;

pub use error::{ApiError, ApiJson, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                          - Health check
/// /openapi.json                    - OpenAPI specification
/// /devices                         - Registry snapshot
/// /devices/{id}/provision          - BLE provisioning
/// /devices/{id}/update-wifi        - Wi-Fi change
/// /devices/{id}/factory-reset      - Factory reset
/// /devices/{id}/log                - Event log
/// /devices/{id}/details            - Static details
/// /devices/{id}/health             - One-off liveness probe
/// /devices/{id}/keepalive          - Watchdog feed
/// /devices/{id}/session/status     - Session status
/// /devices/{id}/session/arm        - Arm
/// /devices/{id}/session/test       - Test lock
/// /devices/{id}/session/abort      - Abort
/// /devices/{id}/session/reward     - Reward code
/// ```
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .route("/openapi.json", get(openapi::get_openapi_spec))
        .nest("/devices", devices::router())
        .nest("/devices/{id}/session", session::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Json;
    use axum_test::TestServer;
    use keyholder_core::provisioning::SERVICE_UUID;
    use keyholder_core::registry::ProvisioningState;
    use keyholder_core::{Config, MockCentral, Provisioner, Registry, ScanControl, Sighting};
    use serde_json::{json, Value};
    use std::sync::Arc;

    const BLE_ID: &str = "ble:AA:BB:CC:DD:EE:FF";
    const BLE_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    /// Minimal stand-in for a device's HTTP API on a loopback port.
    async fn spawn_device() -> u16 {
        let app = Router::new()
            .route(
                "/status",
                get(|| async { Json(json!({"phase": "ready", "stats": {"streak": 2}})) }),
            )
            .route(
                "/arm",
                post(|Json(body): Json<Value>| async move {
                    if body["duration_secs"] == 5 {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": "VALIDATION_ERROR", "message": "too short"})),
                        );
                    }
                    (StatusCode::OK, Json(json!({"phase": "armed"})))
                }),
            )
            .route(
                "/abort",
                post(|| async {
                    (
                        StatusCode::CONFLICT,
                        Json(json!({"error": "BUSY", "message": "cannot abort while ready"})),
                    )
                }),
            )
            .route("/keepalive", post(|| async { Json(json!({"ok": true})) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    fn ready(id: &str, port: u16) -> Sighting {
        Sighting {
            id: id.to_string(),
            name: "Keyholder".to_string(),
            state: ProvisioningState::Ready,
            address: Some("127.0.0.1".to_string()),
            port: Some(port),
            mac: None,
            peripheral: None,
        }
    }

    fn server(registry: Registry, provisioner: Option<Provisioner>) -> TestServer {
        let mut config = Config::default();
        config.forwarder.request_timeout_ms = 500;
        let state = AppState::new(config, registry, provisioner).unwrap();
        TestServer::new(create_router(state)).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_openapi() {
        let server = server(Registry::new(), None);

        let health = server.get("/health").await;
        health.assert_status_ok();
        assert_eq!(health.json::<Value>()["status"], "ok");

        let spec = server.get("/openapi.json").await;
        spec.assert_status_ok();
        assert_eq!(spec.json::<Value>()["info"]["title"], "keyholder API");
    }

    #[tokio::test]
    async fn test_list_devices() {
        let registry = Registry::new();
        registry.upsert(ready("mdns:b", 8080)).await;
        registry.upsert(ready("mdns:a", 8080)).await;

        let response = server(registry, None).get("/devices").await;
        response.assert_status_ok();
        let devices = response.json::<Vec<Value>>();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["id"], "mdns:a");
        assert_eq!(devices[0]["state"], "ready");
    }

    #[tokio::test]
    async fn test_session_commands_are_relayed() {
        let port = spawn_device().await;
        let registry = Registry::new();
        registry.upsert(ready("mdns:lock", port)).await;
        let server = server(registry, None);

        let status = server.get("/devices/mdns:lock/session/status").await;
        status.assert_status_ok();
        assert_eq!(status.json::<Value>()["stats"]["streak"], 2);

        let armed = server
            .post("/devices/mdns:lock/session/arm")
            .json(&json!({"strategy": "auto_countdown", "duration_secs": 60, "penalty_secs": 60}))
            .await;
        armed.assert_status_ok();
        assert_eq!(armed.json::<Value>()["phase"], "armed");

        server
            .post("/devices/mdns:lock/keepalive")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_device_errors_map_to_taxonomy() {
        let port = spawn_device().await;
        let registry = Registry::new();
        registry.upsert(ready("mdns:lock", port)).await;
        let server = server(registry, None);

        let busy = server.post("/devices/mdns:lock/session/abort").await;
        busy.assert_status(StatusCode::CONFLICT);
        let body = busy.json::<ErrorResponse>();
        assert_eq!(body.error, "BUSY");
        assert!(body.message.contains("cannot abort while ready"));

        let invalid = server
            .post("/devices/mdns:lock/session/arm")
            .json(&json!({"strategy": "auto_countdown", "duration_secs": 5, "penalty_secs": 60}))
            .await;
        invalid.assert_status(StatusCode::BAD_REQUEST);

        let missing = server.get("/devices/mdns:nope/session/status").await;
        missing.assert_status(StatusCode::NOT_FOUND);
        assert_eq!(missing.json::<ErrorResponse>().error, "NOT_FOUND");

        // Device has no /log route.
        server
            .get("/devices/mdns:lock/log")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = dead.local_addr().unwrap().port();
        drop(dead);

        let registry = Registry::new();
        registry.upsert(ready("mdns:gone", port)).await;
        let server = server(registry, None);

        server
            .get("/devices/mdns:gone/details")
            .await
            .assert_status(StatusCode::BAD_GATEWAY);

        let health = server.get("/devices/mdns:gone/health").await;
        health.assert_status_ok();
        assert_eq!(health.json::<Value>()["healthy"], false);
    }

    #[tokio::test]
    async fn test_device_health_reports_live_device() {
        let port = spawn_device().await;
        let registry = Registry::new();
        registry.upsert(ready("mdns:lock", port)).await;

        let response = server(registry, None).get("/devices/mdns:lock/health").await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        assert_eq!(body["healthy"], true);
        assert_eq!(body["failures"], 0);
    }

    #[tokio::test]
    async fn test_update_wifi_rejects_bad_credentials_locally() {
        let registry = Registry::new();
        registry.upsert(ready("mdns:lock", 1)).await;

        let response = server(registry, None)
            .post("/devices/mdns:lock/update-wifi")
            .json(&json!({"ssid": "", "password": "secret"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_bodies_use_error_envelope() {
        let registry = Registry::new();
        registry.upsert(ready("mdns:lock", 1)).await;
        let server = server(registry, None);

        let garbled = server
            .post("/devices/mdns:lock/session/arm")
            .text("{not json")
            .content_type("application/json")
            .await;
        garbled.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(garbled.json::<ErrorResponse>().error, "VALIDATION_ERROR");

        let wrong_shape = server
            .post("/devices/mdns:lock/update-wifi")
            .json(&json!({"ssid": "home", "passphrase": "pw"}))
            .await;
        wrong_shape.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(wrong_shape.json::<ErrorResponse>().error, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_provision_without_bluetooth_is_unavailable() {
        let response = server(Registry::new(), None)
            .post("/devices/ble:AA/provision")
            .json(&json!({"wifi": {"ssid": "home", "password": "pw"}}))
            .await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.json::<ErrorResponse>().error,
            "BLUETOOTH_UNAVAILABLE"
        );
    }

    #[tokio::test]
    async fn test_provision_over_mock_bluetooth() {
        let central = MockCentral::new();
        let characteristics: Vec<&str> = keyholder_core::provisioning::ProvisioningField::ORDER
            .iter()
            .map(|field| field.uuid())
            .collect();
        central.add_peripheral(BLE_ADDRESS, SERVICE_UUID, &characteristics);

        let registry = Registry::new();
        registry
            .upsert(Sighting {
                id: BLE_ID.to_string(),
                name: "Keyholder".to_string(),
                state: ProvisioningState::Unprovisioned,
                address: None,
                port: None,
                mac: Some(BLE_ADDRESS.to_string()),
                peripheral: Some(keyholder_core::PeripheralHandle::new(BLE_ADDRESS)),
            })
            .await;
        let provisioner = Provisioner::new(
            Arc::new(central.clone()),
            registry.clone(),
            ScanControl::new(),
        );
        let server = server(registry.clone(), Some(provisioner));

        let response = server
            .post(&format!("/devices/{BLE_ID}/provision"))
            .json(&json!({"wifi": {"ssid": "home", "password": "pw"}}))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["fields_written"], 10);
        assert_eq!(central.writes().len(), 10);
        assert!(registry.get(BLE_ID).await.is_none());

        // Ready devices cannot be provisioned.
        registry.upsert(ready("mdns:lock", 1)).await;
        server
            .post("/devices/mdns:lock/provision")
            .json(&json!({"wifi": {"ssid": "home", "password": "pw"}}))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
