//! # Fake Charging Station
//!
//! Simulator of an OCPP 1.6-J charging station. It connects to a CSMS over
//! WebSocket, speaks the OCPP-J dialect authentically (boot notification,
//! heartbeats, status notifications, metering, transactions), accepts remote
//! operator commands, and exposes an HTTP control surface for driving
//! charging sessions by hand or through scripted session plans.
//!
//! ## Layout
//!
//! - **ocpp**: wire framing and the typed OCPP 1.6 payload subset
//! - **station**: the simulation engine (connectors, RPC link, handlers,
//!   background loops, session plans, lifecycle supervision)
//! - **api**: axum control surface consumed by operators and test rigs
//! - **config**: environment-sourced settings
//! - **support**: errors and shutdown plumbing

pub mod api;
pub mod config;
pub mod ocpp;
pub mod station;
pub mod support;

pub use api::{create_router, AppState};
pub use config::Settings;
pub use station::{
    execute_session_plan, start_station, stop_station, ChargingStation, SessionPlanRequest,
    StationConfig,
};
pub use support::errors::{BootstrapError, ProtocolError, RejectedRequest, StationError};
