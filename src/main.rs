//! Fake charging station entrypoint.
//!
//! Loads settings from the environment, boots the station against the
//! configured CSMS (unless running on demand) and serves the HTTP control
//! surface until a shutdown signal arrives.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fake_charging_station::station::{start_station, stop_station};
use fake_charging_station::support::shutdown::{listen_for_shutdown_signals, ShutdownSignal};
use fake_charging_station::{create_router, AppState, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let settings = match Settings::load() {
        Ok(settings) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level)),
                )
                .init();
            settings
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("info"))
                .init();
            error!("Invalid configuration: {e}");
            return Err(e.into());
        }
    };

    info!(cs_id = %settings.cs_id, "Starting fake charging station");

    let shutdown = ShutdownSignal::new();
    tokio::spawn(listen_for_shutdown_signals(shutdown.clone()));

    let state = AppState::new(settings.clone(), shutdown.clone());

    if settings.on_demand {
        info!(
            "Starting without a station instance. \
             Use the session plan endpoint to create one."
        );
    } else {
        match start_station(&settings).await {
            Ok(station) => state.install(station),
            Err(e) => {
                error!(error = %e, "Unable to boot the charging station");
                return Err(e.into());
            }
        }
    }

    let router = create_router(state.clone());
    let address = format!("{}:{}", settings.api_host, settings.api_port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Control API listening on http://{address}");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { serve_shutdown.wait().await })
        .await?;

    if let Some(station) = state.station() {
        stop_station(&station).await;
    }

    info!("Shutdown complete");
    Ok(())
}
