//! Session-plan driver.
//!
//! A session plan boots a dedicated station instance and walks it through an
//! ordered list of steps. Steps arrive as loose JSON arrays
//! (`["plugin", 1, "12341234"]`) and are parsed leniently: ids and seconds
//! may be numbers or numeric strings; unknown steps are logged and skipped.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::ocpp::types::Reason;
use crate::support::errors::BootstrapError;

use super::supervisor::basic_authorization;
use super::{ChargingStation, StationConfig};

fn default_connectors() -> u32 {
    1
}

/// Request body of the session-plan endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionPlanRequest {
    pub cs_id: String,
    pub vendor: String,
    pub model: String,
    pub ws_url: String,
    pub password: String,
    #[serde(default = "default_connectors")]
    pub connectors: u32,
    pub steps: Vec<Vec<Value>>,
}

/// One decoded session-plan step.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStep {
    Wait(u64),
    PlugIn { connector_id: u32, rfid: String },
    Charge { connector_id: u32, limit: f64 },
    Stop { connector_id: u32, reason: Option<Reason> },
    Unplug { connector_id: u32, stop_tx: bool },
    Status,
    Disconnect,
}

impl SessionStep {
    /// Decode a raw step; `None` means the token is not understood.
    pub fn parse(raw: &[Value]) -> Option<Self> {
        let step = match raw.first().and_then(Value::as_str)? {
            "wait" => Self::Wait(as_u64(raw.get(1)?)?),
            "plugin" => Self::PlugIn {
                connector_id: as_u32(raw.get(1)?)?,
                rfid: raw.get(2)?.as_str()?.to_string(),
            },
            "charge" => Self::Charge {
                connector_id: as_u32(raw.get(1)?)?,
                limit: as_f64(raw.get(2)?)?,
            },
            "stop" => Self::Stop {
                connector_id: as_u32(raw.get(1)?)?,
                reason: raw.get(2).and_then(parse_reason),
            },
            "unplug" => Self::Unplug {
                connector_id: as_u32(raw.get(1)?)?,
                stop_tx: raw.get(2).and_then(as_bool).unwrap_or(true),
            },
            "status" => Self::Status,
            "disconnect" => Self::Disconnect,
            _ => return None,
        };
        Some(step)
    }
}

/// Boot a fresh station and execute the plan against it. The station is
/// disconnected after the final step regardless of what the plan did.
pub async fn execute_session_plan(request: SessionPlanRequest) -> Result<(), BootstrapError> {
    info!(cs_id = %request.cs_id, steps = request.steps.len(), "Executing session plan");

    let mut config = StationConfig::new(&request.cs_id, &request.vendor, &request.model);
    config.number_of_connectors = request.connectors;
    let station = ChargingStation::new(config);

    let authorization = basic_authorization(&request.cs_id, &request.password);
    if !station
        .clone()
        .boot_up(&request.ws_url, &authorization)
        .await?
    {
        return Err(BootstrapError::Denied);
    }

    for raw in &request.steps {
        match SessionStep::parse(raw) {
            Some(step) => run_step(&station, step).await,
            None => warn!(step = %serde_json::Value::Array(raw.clone()), "Skipping unsupported step"),
        }
    }

    info!("Finished session plan");
    station.disconnect().await;
    Ok(())
}

async fn run_step(station: &ChargingStation, step: SessionStep) {
    let outcome = match step {
        SessionStep::Wait(secs) => {
            info!(secs, "Waiting");
            sleep(Duration::from_secs(secs)).await;
            Ok(())
        }
        SessionStep::PlugIn { connector_id, rfid } => {
            station.plug_in(connector_id, Some(&rfid)).await
        }
        SessionStep::Charge {
            connector_id,
            limit,
        } => station.set_charging_profile(connector_id, limit).await,
        SessionStep::Stop {
            connector_id,
            reason,
        } => station.send_stop_transaction(connector_id, reason).await,
        SessionStep::Unplug {
            connector_id,
            stop_tx,
        } => station.unplug(connector_id, stop_tx).await,
        SessionStep::Status => Ok(()),
        SessionStep::Disconnect => {
            station.disconnect().await;
            Ok(())
        }
    };

    if let Err(e) = outcome {
        warn!(error = %e, "Session plan step failed");
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    as_u64(value).and_then(|v| u32::try_from(v).ok())
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "True" => Some(true),
            "false" | "False" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_reason(value: &Value) -> Option<Reason> {
    match serde_json::from_value(value.clone()) {
        Ok(reason) => Some(reason),
        Err(_) => {
            warn!(reason = %value, "Ignoring unknown stop reason");
            None
        }
    }
}
