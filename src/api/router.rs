//! Control-surface routing.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{handlers, AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/fcs/connector/{connector_id}/status", get(handlers::status))
        .route("/fcs/connector/{connector_id}/plugin", post(handlers::plugin))
        .route("/fcs/connector/{connector_id}/start", post(handlers::start))
        .route(
            "/fcs/connector/{connector_id}/set_charging_profile",
            post(handlers::set_charging_profile),
        )
        .route("/fcs/connector/{connector_id}/stop", post(handlers::stop))
        .route("/fcs/connector/{connector_id}/unplug", post(handlers::unplug))
        .route("/fcs/data_transfer", post(handlers::data_transfer))
        .route("/fcs/disconnect", post(handlers::disconnect))
        .route("/fcs/state", get(handlers::internal_state))
        .route("/fcs/session_plan", post(handlers::session_plan))
        .route("/fcs/shutdown", post(handlers::shutdown))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
