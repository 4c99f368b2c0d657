//! Request parameters and the error body of the control surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::ocpp::types::Reason;
use crate::support::errors::StationError;

fn default_rfid() -> String {
    "12341234".to_string()
}

fn default_limit() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PluginParams {
    pub rfid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartParams {
    #[serde(default = "default_rfid")]
    pub rfid: String,
}

#[derive(Debug, Deserialize)]
pub struct ChargingProfileParams {
    #[serde(default = "default_limit")]
    pub limit: f64,
}

#[derive(Debug, Deserialize)]
pub struct StopParams {
    pub reason: Option<Reason>,
}

#[derive(Debug, Deserialize)]
pub struct UnplugParams {
    #[serde(default = "default_true")]
    pub stop_tx: bool,
}

/// Error reply carrying a `{"detail": …}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            detail: detail.into(),
        }
    }

    pub fn bad_gateway(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            detail: detail.into(),
        }
    }
}

impl From<StationError> for ApiError {
    fn from(error: StationError) -> Self {
        let status = match &error {
            StationError::UnknownConnector(_) => StatusCode::NOT_FOUND,
            StationError::NotReadyToCharge | StationError::Rejected(_) => StatusCode::CONFLICT,
            StationError::Protocol(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            detail: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}
