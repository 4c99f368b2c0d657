//! Lifecycle supervision: build-and-boot, quick start, graceful stop.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Settings;
use crate::support::errors::{BootstrapError, StationError};

use super::{ChargingStation, StationConfig};

const QUICK_START_DELAY: Duration = Duration::from_secs(3);

/// Build the HTTP Basic `Authorization` header value used during the
/// WebSocket handshake.
pub fn basic_authorization(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

impl From<&Settings> for StationConfig {
    fn from(settings: &Settings) -> Self {
        let mut config = StationConfig::new(&settings.cs_id, &settings.vendor, &settings.model);
        config.number_of_connectors = settings.connectors;
        config.tx_start_charge = settings.quick_start_charging;
        config
    }
}

/// Build a station from the settings, boot it against the configured CSMS
/// and apply the quick-start sequence when enabled.
pub async fn start_station(settings: &Settings) -> Result<Arc<ChargingStation>, BootstrapError> {
    let station = ChargingStation::new(StationConfig::from(settings));
    let authorization = basic_authorization(&settings.cs_id, &settings.password);

    if !station
        .clone()
        .boot_up(&settings.ws_url, &authorization)
        .await?
    {
        return Err(BootstrapError::Denied);
    }

    if let Err(e) = quick_start(&station, settings).await {
        warn!(error = %e, "Quick start failed");
    }

    Ok(station)
}

/// Plug in and optionally start charging without waiting for an operator.
async fn quick_start(station: &ChargingStation, settings: &Settings) -> Result<(), StationError> {
    if !settings.quick_start {
        return Ok(());
    }

    info!(
        connector_id = settings.quick_start_connector,
        rfid = %settings.quick_start_rfid,
        "Applying quick start"
    );
    sleep(QUICK_START_DELAY).await;
    station
        .plug_in(
            settings.quick_start_connector,
            Some(&settings.quick_start_rfid),
        )
        .await?;

    if let Some(limit) = settings.quick_start_charging {
        sleep(QUICK_START_DELAY).await;
        station
            .set_charging_profile(settings.quick_start_connector, limit)
            .await?;
    }
    Ok(())
}

/// Gracefully wind a station down: unplug everything, let trailing messages
/// drain, then disconnect if the CSMS has not already done so.
pub async fn stop_station(station: &ChargingStation) {
    info!("Stopping services gracefully");
    for connector_id in station.connector_ids() {
        if let Err(e) = station.unplug(connector_id, true).await {
            warn!(connector_id, error = %e, "Unplug during shutdown failed");
        }
    }

    sleep(Duration::from_secs(5)).await;

    if station.connected() {
        station.disconnect().await;
    }
}
