//! Control-surface endpoint handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::station::{execute_session_plan, SessionPlanRequest, StationSnapshot};

use super::dto::{
    ApiError, ChargingProfileParams, PluginParams, StartParams, StopParams, UnplugParams,
};
use super::AppState;

/// Send a StatusNotification for one connector.
pub async fn status(
    State(state): State<AppState>,
    Path(connector_id): Path<u32>,
) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station.send_status_notification(connector_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Plug in a connector; with an RFID the authorize/start flow runs too.
pub async fn plugin(
    State(state): State<AppState>,
    Path(connector_id): Path<u32>,
    Query(params): Query<PluginParams>,
) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station
        .plug_in(connector_id, params.rfid.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Authorize an RFID and start a transaction at a connector.
pub async fn start(
    State(state): State<AppState>,
    Path(connector_id): Path<u32>,
    Query(params): Query<StartParams>,
) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station.send_auth_start(connector_id, &params.rfid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Apply a charging profile with the given limit in watts.
///
/// Positive limits drive the connector into Charging; 0, -1 and -2 report
/// SuspendedEVSE, SuspendedEV and Finishing respectively.
pub async fn set_charging_profile(
    State(state): State<AppState>,
    Path(connector_id): Path<u32>,
    Query(params): Query<ChargingProfileParams>,
) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station
        .set_charging_profile(connector_id, params.limit)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stop the transaction at a connector.
pub async fn stop(
    State(state): State<AppState>,
    Path(connector_id): Path<u32>,
    Query(params): Query<StopParams>,
) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station
        .send_stop_transaction(connector_id, params.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unplug a connector, stopping an owed transaction unless told otherwise.
pub async fn unplug(
    State(state): State<AppState>,
    Path(connector_id): Path<u32>,
    Query(params): Query<UnplugParams>,
) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station.unplug(connector_id, params.stop_tx).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Forward a JSON payload to the CSMS as a DataTransfer.
pub async fn data_transfer(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station.send_data_transfer(&payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Close the OCPP session.
pub async fn disconnect(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    let station = state.require_station()?;
    station.disconnect().await;
    Ok(StatusCode::NO_CONTENT)
}

/// Snapshot of the station state for inspection.
pub async fn internal_state(
    State(state): State<AppState>,
) -> Result<Json<StationSnapshot>, ApiError> {
    let station = state.require_station()?;
    Ok(Json(station.snapshot()))
}

/// Boot a dedicated station and drive it through a session plan.
pub async fn session_plan(
    State(_state): State<AppState>,
    Json(request): Json<SessionPlanRequest>,
) -> Result<Json<Value>, ApiError> {
    execute_session_plan(request)
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;
    Ok(Json(json!({"message": "Session plan executed"})))
}

/// Trigger a graceful process shutdown.
pub async fn shutdown(State(state): State<AppState>) -> StatusCode {
    info!("Shutdown requested through the control surface");
    state.shutdown().trigger();
    StatusCode::NO_CONTENT
}
