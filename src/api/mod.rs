//! Operator-facing HTTP control surface.
//!
//! Thin axum layer over the station operations: every endpoint resolves the
//! running station from [`AppState`], invokes one operation and maps the
//! typed errors onto HTTP statuses with a `{"detail": …}` body.

mod dto;
mod handlers;
mod router;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Settings;
use crate::station::ChargingStation;
use crate::support::shutdown::ShutdownSignal;

pub use dto::ApiError;
pub use router::create_router;

struct AppStateInner {
    settings: Settings,
    station: RwLock<Option<Arc<ChargingStation>>>,
    shutdown: ShutdownSignal,
}

/// Shared state of the control surface.
#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

impl AppState {
    pub fn new(settings: Settings, shutdown: ShutdownSignal) -> Self {
        Self(Arc::new(AppStateInner {
            settings,
            station: RwLock::new(None),
            shutdown,
        }))
    }

    /// Attach the booted station instance the endpoints operate on.
    pub fn install(&self, station: Arc<ChargingStation>) {
        *self.0.station.write() = Some(station);
    }

    pub fn station(&self) -> Option<Arc<ChargingStation>> {
        self.0.station.read().clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.0.settings
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.0.shutdown
    }

    fn require_station(&self) -> Result<Arc<ChargingStation>, ApiError> {
        self.station()
            .ok_or_else(|| ApiError::conflict("No charging station is running"))
    }
}
