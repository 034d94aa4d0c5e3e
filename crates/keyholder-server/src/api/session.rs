//! Session API endpoints, relayed to the device's state machine.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;

use keyholder_core::session::RewardView;
use keyholder_core::{DeviceCommand, SessionConfig, SessionStatus};

use crate::api::devices::{relay, Relayed};
use crate::api::error::{ApiJson, ApiResult};
use crate::state::AppState;

/// Creates the session router, nested under `/devices/{id}/session`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/arm", post(arm))
        .route("/test", post(start_test))
        .route("/abort", post(abort))
        .route("/reward", get(get_reward))
}

/// Read the session status.
#[utoipa::path(
    get,
    path = "/devices/{id}/session/status",
    tag = "session",
    operation_id = "getSessionStatus",
    summary = "Read the current session status",
    description = "Phase, remaining seconds for the active timer and lifetime stats. \
        `lock_remaining_secs` is null while locked if the session hides its timer.",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Session status", body = SessionStatus),
        (status = 404, description = "Unknown device", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::Status).await
}

/// Arm a session.
#[utoipa::path(
    post,
    path = "/devices/{id}/session/arm",
    tag = "session",
    operation_id = "armSession",
    summary = "Arm a lock session",
    description = "Only valid while the device is ready. Any payback debt is added to the \
        requested duration.",
    params(("id" = String, Path, description = "Device id")),
    request_body = SessionConfig,
    responses(
        (status = 200, description = "Session armed", body = SessionStatus),
        (status = 400, description = "Out-of-range value or bad channel", body = crate::api::error::ErrorResponse),
        (status = 409, description = "Device is not ready", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn arm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(config): ApiJson<SessionConfig>,
) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::Arm(config)).await
}

/// Start the test phase.
#[utoipa::path(
    post,
    path = "/devices/{id}/session/test",
    tag = "session",
    operation_id = "startSessionTest",
    summary = "Run a short test lock",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Test started", body = SessionStatus),
        (status = 409, description = "Device is not ready", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn start_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::StartTest).await
}

/// Abort the session.
#[utoipa::path(
    post,
    path = "/devices/{id}/session/abort",
    tag = "session",
    operation_id = "abortSession",
    summary = "Abort the current session",
    description = "Aborting an armed or testing session returns to ready with no stat change. \
        Aborting a locked session counts as a hard abort and may start the penalty phase.",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Session aborted", body = SessionStatus),
        (status = 409, description = "Nothing to abort", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn abort(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::Abort).await
}

/// Read the reward code.
#[utoipa::path(
    get,
    path = "/devices/{id}/session/reward",
    tag = "session",
    operation_id = "getSessionReward",
    summary = "Read the reward code",
    description = "Hidden while a session is armed, locked or in its penalty phase.",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Latest reward and history", body = RewardView),
        (status = 409, description = "Reward is hidden in this phase", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Device unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_reward(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Relayed> {
    relay(&state, &id, DeviceCommand::Reward).await
}
