//! Inbound action registration table.
//!
//! Maps each supported CSMS-initiated action to its `on` hook (computes the
//! synchronous reply) and optional `after` hook (runs once the reply has
//! been handed to the writer, on its own task so it may call back into the
//! CSMS). Actions missing from the table are answered with a
//! `NotImplemented` CallError by the link.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::rpc::DispatchError;
use super::ChargingStation;

pub(crate) type OnHook =
    for<'a> fn(&'a ChargingStation, &'a Value) -> BoxFuture<'a, Result<Value, DispatchError>>;
pub(crate) type AfterHook = fn(Arc<ChargingStation>, Value) -> BoxFuture<'static, ()>;

pub(crate) struct Route {
    pub on: OnHook,
    pub after: Option<AfterHook>,
}

pub(crate) fn lookup(action: &str) -> Option<Route> {
    let route = match action {
        "RemoteStartTransaction" => Route {
            on: on_remote_start,
            after: Some(after_remote_start),
        },
        "RemoteStopTransaction" => Route {
            on: on_remote_stop,
            after: Some(after_remote_stop),
        },
        "GetConfiguration" => Route {
            on: on_get_configuration,
            after: None,
        },
        "ChangeConfiguration" => Route {
            on: on_change_configuration,
            after: None,
        },
        "ChangeAvailability" => Route {
            on: on_change_availability,
            after: Some(after_change_availability),
        },
        "SetChargingProfile" => Route {
            on: on_set_charging_profile,
            after: Some(after_set_charging_profile),
        },
        _ => return None,
    };
    Some(route)
}

fn on_remote_start<'a>(
    station: &'a ChargingStation,
    payload: &'a Value,
) -> BoxFuture<'a, Result<Value, DispatchError>> {
    Box::pin(station.on_remote_start_transaction(payload))
}

fn after_remote_start(station: Arc<ChargingStation>, payload: Value) -> BoxFuture<'static, ()> {
    Box::pin(async move { station.after_remote_start_transaction(&payload).await })
}

fn on_remote_stop<'a>(
    station: &'a ChargingStation,
    payload: &'a Value,
) -> BoxFuture<'a, Result<Value, DispatchError>> {
    Box::pin(station.on_remote_stop_transaction(payload))
}

fn after_remote_stop(station: Arc<ChargingStation>, payload: Value) -> BoxFuture<'static, ()> {
    Box::pin(async move { station.after_remote_stop_transaction(&payload).await })
}

fn on_get_configuration<'a>(
    station: &'a ChargingStation,
    payload: &'a Value,
) -> BoxFuture<'a, Result<Value, DispatchError>> {
    Box::pin(station.on_get_configuration(payload))
}

fn on_change_configuration<'a>(
    station: &'a ChargingStation,
    payload: &'a Value,
) -> BoxFuture<'a, Result<Value, DispatchError>> {
    Box::pin(station.on_change_configuration(payload))
}

fn on_change_availability<'a>(
    station: &'a ChargingStation,
    payload: &'a Value,
) -> BoxFuture<'a, Result<Value, DispatchError>> {
    Box::pin(station.on_change_availability(payload))
}

fn after_change_availability(
    station: Arc<ChargingStation>,
    payload: Value,
) -> BoxFuture<'static, ()> {
    Box::pin(async move { station.after_change_availability(&payload).await })
}

fn on_set_charging_profile<'a>(
    station: &'a ChargingStation,
    payload: &'a Value,
) -> BoxFuture<'a, Result<Value, DispatchError>> {
    Box::pin(station.on_set_charging_profile(payload))
}

fn after_set_charging_profile(
    station: Arc<ChargingStation>,
    payload: Value,
) -> BoxFuture<'static, ()> {
    Box::pin(async move { station.after_set_charging_profile(&payload).await })
}
