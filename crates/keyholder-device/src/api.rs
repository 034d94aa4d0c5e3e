//! Device-facing HTTP API.
//!
//! The routes the control surface forwards to, plus `/trigger` (the physical
//! button), `/reboot` and `/features` which stand in for hardware and the
//! BLE provisioning characteristics on the reference device. Errors use the
//! same `{"error", "message", "details"}` body as the control surface.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use keyholder_core::session::{RewardView, SessionCommand};
use keyholder_core::{
    DeviceDetails, DeviceFeatures, KeyholderError, LogLine, SessionConfig, SessionError,
    SessionStatus, WifiCredentials,
};

use crate::runtime::DeviceRuntime;

/// Error rendered with the core taxonomy's status and code.
#[derive(Debug)]
pub struct DeviceApiError(KeyholderError);

impl From<KeyholderError> for DeviceApiError {
    fn from(err: KeyholderError) -> Self {
        Self(err)
    }
}

impl From<SessionError> for DeviceApiError {
    fn from(err: SessionError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for DeviceApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": self.0.error_code(),
            "message": self.0.to_string(),
            "details": null,
        });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for DeviceApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(KeyholderError::Validation(rejection.body_text()))
    }
}

/// JSON body extractor whose rejections use the error body above.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(DeviceApiError))]
pub struct DeviceJson<T>(pub T);

type DeviceResult<T> = Result<Json<T>, DeviceApiError>;

/// Router over `runtime`.
pub fn router(runtime: DeviceRuntime) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/details", get(details))
        .route("/arm", post(arm))
        .route("/trigger", post(trigger))
        .route("/abort", post(abort))
        .route("/start-test", post(start_test))
        .route("/keepalive", post(keepalive))
        .route("/reward", get(reward))
        .route("/log", get(log))
        .route("/update-wifi", post(update_wifi))
        .route("/features", post(set_features))
        .route("/factory-reset", post(factory_reset))
        .route("/reboot", post(reboot))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

async fn run(runtime: &DeviceRuntime, command: SessionCommand) -> DeviceResult<SessionStatus> {
    Ok(Json(runtime.execute(command).await?))
}

async fn status(State(runtime): State<DeviceRuntime>) -> Json<SessionStatus> {
    Json(runtime.status().await)
}

async fn details(State(runtime): State<DeviceRuntime>) -> Json<DeviceDetails> {
    Json(runtime.details().await)
}

async fn arm(
    State(runtime): State<DeviceRuntime>,
    DeviceJson(config): DeviceJson<SessionConfig>,
) -> DeviceResult<SessionStatus> {
    run(&runtime, SessionCommand::Arm(config)).await
}

async fn trigger(State(runtime): State<DeviceRuntime>) -> DeviceResult<SessionStatus> {
    run(&runtime, SessionCommand::Trigger).await
}

async fn abort(State(runtime): State<DeviceRuntime>) -> DeviceResult<SessionStatus> {
    run(&runtime, SessionCommand::Abort).await
}

async fn start_test(State(runtime): State<DeviceRuntime>) -> DeviceResult<SessionStatus> {
    run(&runtime, SessionCommand::StartTest).await
}

async fn keepalive(State(runtime): State<DeviceRuntime>) -> DeviceResult<SessionStatus> {
    run(&runtime, SessionCommand::Keepalive).await
}

async fn reboot(State(runtime): State<DeviceRuntime>) -> DeviceResult<SessionStatus> {
    run(&runtime, SessionCommand::Reinitialize).await
}

async fn reward(State(runtime): State<DeviceRuntime>) -> DeviceResult<RewardView> {
    Ok(Json(runtime.reward().await?))
}

async fn log(State(runtime): State<DeviceRuntime>) -> Json<Vec<LogLine>> {
    Json(runtime.log().await)
}

async fn update_wifi(
    State(runtime): State<DeviceRuntime>,
    DeviceJson(credentials): DeviceJson<WifiCredentials>,
) -> DeviceResult<Value> {
    let ssid = credentials.ssid.clone();
    runtime.update_wifi(credentials).await?;
    Ok(Json(json!({ "ssid": ssid })))
}

async fn set_features(
    State(runtime): State<DeviceRuntime>,
    DeviceJson(features): DeviceJson<DeviceFeatures>,
) -> DeviceResult<DeviceDetails> {
    runtime.set_features(features).await?;
    Ok(Json(runtime.details().await))
}

async fn factory_reset(State(runtime): State<DeviceRuntime>) -> DeviceResult<Value> {
    runtime.factory_reset().await?;
    Ok(Json(json!({ "rebooting": true })))
}
