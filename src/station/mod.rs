//! The OCPP 1.6 charging station simulation engine.
//!
//! [`ChargingStation`] owns the connector bank, the configuration map, the
//! transaction index and the background tasks, and implements both sides of
//! the dialogue: operator-driven operations (plug in, authorize, stop,
//! unplug, …) that emit calls towards the CSMS, and the inbound handlers for
//! the remote commands a CSMS may send.
//!
//! All station state lives in one [`StationState`] behind a mutex that is
//! never held across a suspension point, so the state has exactly one writer
//! at a time while handlers still interleave at their awaits.

pub mod connector;
pub mod meter_values;
pub mod plan;
pub mod rpc;
mod routes;
pub mod supervisor;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::ocpp::messages::{
    AuthorizeRequest, AuthorizeResponse, BootNotificationRequest, BootNotificationResponse,
    ChangeAvailabilityRequest, ChangeAvailabilityResponse, ChangeConfigurationRequest,
    ChangeConfigurationResponse, DataTransferRequest, GetConfigurationRequest,
    GetConfigurationResponse, HeartbeatRequest, HeartbeatResponse, MeterValuesRequest,
    MeterValuesResponse, RemoteStartTransactionRequest, RemoteStartTransactionResponse,
    RemoteStopTransactionResponse, SetChargingProfileRequest, SetChargingProfileResponse,
    StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest,
    StatusNotificationResponse, StopTransactionRequest, StopTransactionResponse,
};
use crate::ocpp::types::{
    AuthorizationStatus, AvailabilityStatus, ChargePointErrorCode, ChargePointStatus,
    ChargingProfile, ChargingProfileKind, ChargingProfilePurpose, ChargingProfileStatus,
    ChargingRateUnit, ChargingSchedule, ChargingSchedulePeriod, ConfigurationStatus, KeyValue,
    Reason, RegistrationStatus, RemoteStartStopStatus,
};
use crate::support::errors::{BootstrapError, ProtocolError, RejectedRequest, StationError};

pub use connector::{Connector, PendingStopTx};
pub use plan::{execute_session_plan, SessionPlanRequest, SessionStep};
pub use rpc::{DispatchError, InboundDispatch, OcppLink};
pub use supervisor::{basic_authorization, start_station, stop_station};

/// OCPP 1.6-J WebSocket subprotocol.
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Connector id 0 addresses every connector at once.
pub const WILDCARD_CONNECTOR_ID: u32 = 0;

const FIRMWARE_VERSION: &str = "v1337";
const SERIAL_NUMBER: &str = "12345678";
const HEARTBEAT_STARTUP_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 600;
const DEFAULT_METER_SAMPLE_INTERVAL_SECS: u64 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Construction parameters for a [`ChargingStation`].
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub cs_id: String,
    pub vendor: String,
    pub model: String,
    pub number_of_connectors: u32,
    /// When set, a freshly started transaction immediately offers this power.
    pub tx_start_charge: Option<f64>,
    /// Settle time between a state change and the trailing StatusNotification.
    pub settle_delay: Duration,
}

impl StationConfig {
    pub fn new(
        cs_id: impl Into<String>,
        vendor: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            cs_id: cs_id.into(),
            vendor: vendor.into(),
            model: model.into(),
            number_of_connectors: 1,
            tx_start_charge: None,
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Mutable station state: everything the handlers and loops share.
struct StationState {
    connectors: BTreeMap<u32, Connector>,
    configuration: BTreeMap<String, String>,
    transaction_connector: HashMap<i32, u32>,
}

impl StationState {
    fn connector(&self, id: u32) -> Result<&Connector, StationError> {
        self.connectors
            .get(&id)
            .ok_or(StationError::UnknownConnector(id))
    }

    fn connector_mut(&mut self, id: u32) -> Result<&mut Connector, StationError> {
        self.connectors
            .get_mut(&id)
            .ok_or(StationError::UnknownConnector(id))
    }
}

/// Read-only view of the station for the control surface.
#[derive(Debug, Serialize)]
pub struct StationSnapshot {
    pub cs_id: String,
    pub connected: bool,
    pub configuration: BTreeMap<String, String>,
    pub connectors: Vec<Connector>,
    pub transactions: HashMap<i32, u32>,
}

pub struct ChargingStation {
    pub cs_id: String,
    vendor: String,
    model: String,
    tx_start_charge: Option<f64>,
    settle_delay: Duration,
    link: OcppLink,
    state: Mutex<StationState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    connected: AtomicBool,
    self_ref: Weak<ChargingStation>,
}

impl ChargingStation {
    pub fn new(config: StationConfig) -> Arc<Self> {
        let (link, outbound_rx) = OcppLink::new();

        let connectors: BTreeMap<u32, Connector> = (1..=config.number_of_connectors)
            .map(|id| (id, Connector::new(id)))
            .collect();

        let configuration = BTreeMap::from([
            ("HeartbeatInterval".to_string(), "600".to_string()),
            (
                "MeterValuesSampledData".to_string(),
                meter_values::METER_VALUES_SAMPLED_DATA.to_string(),
            ),
            ("MeterValueSampleInterval".to_string(), "10".to_string()),
            (
                "NumberOfConnectors".to_string(),
                config.number_of_connectors.to_string(),
            ),
            ("AuthorizeRemoteTxRequests".to_string(), "false".to_string()),
        ]);

        Arc::new_cyclic(|weak| Self {
            cs_id: config.cs_id,
            vendor: config.vendor,
            model: config.model,
            tx_start_charge: config.tx_start_charge,
            settle_delay: config.settle_delay,
            link,
            state: Mutex::new(StationState {
                connectors,
                configuration,
                transaction_connector: HashMap::new(),
            }),
            tasks: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            connected: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connector_ids(&self) -> Vec<u32> {
        self.state.lock().connectors.keys().copied().collect()
    }

    pub fn snapshot(&self) -> StationSnapshot {
        let state = self.state.lock();
        StationSnapshot {
            cs_id: self.cs_id.clone(),
            connected: self.connected(),
            configuration: state.configuration.clone(),
            connectors: state.connectors.values().cloned().collect(),
            transactions: state.transaction_connector.clone(),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Open the WebSocket session and run the boot sequence.
    ///
    /// Returns `Ok(false)` when the CSMS answered the BootNotification with
    /// `Rejected`; background loops are only started on acceptance.
    pub async fn boot_up(
        self: Arc<Self>,
        ws_url: &str,
        authorization: &str,
    ) -> Result<bool, BootstrapError> {
        let url = format!("{}/{}", ws_url.trim_end_matches('/'), self.cs_id);
        info!(cs_id = %self.cs_id, url = %url, "Connecting to CSMS");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| BootstrapError::BadRequest(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(authorization)
                .map_err(|e| BootstrapError::BadRequest(e.to_string()))?,
        );

        let (stream, _) = connect_async(request).await.map_err(|e| {
            BootstrapError::Connect {
                url,
                reason: e.to_string(),
            }
        })?;
        let (sink, ws_rx) = stream.split();

        let outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .ok_or(BootstrapError::AlreadyStarted)?;
        let writer = tokio::spawn(writer_loop(outbound_rx, sink));
        let receiver = tokio::spawn(receiver_loop(self.clone(), ws_rx));
        *self.writer.lock() = Some(writer);

        let accepted = match self.send_boot_notification().await {
            Ok(accepted) => accepted,
            Err(e) => {
                receiver.abort();
                self.link.shutdown();
                return Err(e.into());
            }
        };
        if !accepted {
            warn!(cs_id = %self.cs_id, "BootNotification was not accepted, cancelling receiver");
            receiver.abort();
            self.link.shutdown();
            return Ok(false);
        }

        if let Err(e) = self.announce_connectors().await {
            receiver.abort();
            self.link.shutdown();
            return Err(e.into());
        }

        let heartbeat = tokio::spawn(heartbeat_loop(self.clone()));
        let meter = tokio::spawn(meter_value_loop(self.clone()));
        *self.tasks.lock() = vec![receiver, heartbeat, meter];

        self.connected.store(true, Ordering::SeqCst);
        info!(cs_id = %self.cs_id, "Connected to CSMS");
        Ok(true)
    }

    /// Cancel every owned task and close the WebSocket. Safe to call when
    /// the peer already went away.
    pub async fn disconnect(&self) {
        info!(cs_id = %self.cs_id, "Disconnecting from CSMS");
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }

        self.link.shutdown();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        }

        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_boot_notification(&self) -> Result<bool, ProtocolError> {
        let request = BootNotificationRequest {
            charge_point_vendor: self.vendor.clone(),
            charge_point_model: self.model.clone(),
            charge_point_serial_number: Some(SERIAL_NUMBER.to_string()),
            charge_box_serial_number: None,
            firmware_version: Some(FIRMWARE_VERSION.to_string()),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        };

        let response: BootNotificationResponse =
            self.link.request("BootNotification", &request).await?;

        info!(status = %response.status, "BootNotification status");
        if response.status == RegistrationStatus::Rejected {
            return Ok(false);
        }

        self.state
            .lock()
            .configuration
            .insert("HeartbeatInterval".to_string(), response.interval.to_string());
        Ok(true)
    }

    // ── Operator operations ────────────────────────────────

    /// Plug an EV into a connector; with an RFID the authorize/start flow
    /// runs immediately afterwards.
    pub async fn plug_in(&self, connector_id: u32, rfid: Option<&str>) -> Result<(), StationError> {
        info!(connector_id, "Plugging in");
        self.state.lock().connector_mut(connector_id)?.plugged_in = true;
        self.change_status(connector_id, ChargePointStatus::Preparing)
            .await?;

        if let Some(rfid) = rfid {
            info!(connector_id, "Authenticating and starting transaction");
            self.send_auth_start(connector_id, rfid).await?;
        }
        Ok(())
    }

    /// Authorize against the CSMS and start a transaction.
    pub async fn send_auth_start(&self, connector_id: u32, rfid: &str) -> Result<(), StationError> {
        if !self.state.lock().connector(connector_id)?.plugged_in {
            return Err(
                RejectedRequest::cs("Unable to authorize when nothing is plugged in").into(),
            );
        }

        if self.send_authorize(connector_id, rfid).await? {
            self.send_start_transaction(connector_id).await
        } else {
            Err(RejectedRequest::csms(format!("Could not authorize RFID: {rfid}")).into())
        }
    }

    /// Send an Authorize call; an absent reply counts as a denial.
    async fn send_authorize(&self, connector_id: u32, rfid: &str) -> Result<bool, StationError> {
        let request = AuthorizeRequest {
            id_tag: rfid.to_string(),
        };
        let response: AuthorizeResponse = match self.link.request("Authorize", &request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(connector_id, rfid, error = %e, "Authorize produced no usable reply");
                return Ok(false);
            }
        };

        debug!(connector_id, rfid, status = %response.id_tag_info.status, "Authorize status");
        if response.id_tag_info.status != AuthorizationStatus::Accepted {
            return Ok(false);
        }

        self.state.lock().connector_mut(connector_id)?.id_tag = Some(rfid.to_string());
        self.change_status(connector_id, ChargePointStatus::Preparing)
            .await?;
        Ok(true)
    }

    /// Start a transaction on a connector whose id tag is already recorded.
    pub async fn send_start_transaction(&self, connector_id: u32) -> Result<(), StationError> {
        debug!(connector_id, "Sending StartTransaction");

        let id_tag = match self.state.lock().connector(connector_id)?.id_tag.clone() {
            Some(id_tag) => id_tag,
            None => {
                warn!(connector_id, "No id tag recorded, skipping StartTransaction");
                return Ok(());
            }
        };

        let request = StartTransactionRequest {
            connector_id,
            id_tag,
            meter_start: 0,
            reservation_id: None,
            timestamp: Utc::now().trunc_subsecs(0),
        };
        let response: StartTransactionResponse =
            self.link.request("StartTransaction", &request).await?;

        // A zero transaction id means the backend refused the transaction.
        if response.transaction_id == 0 {
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            {
                let connector = state.connector_mut(connector_id)?;
                connector.transaction_id = Some(response.transaction_id);
                connector.already_stopped = false;
                if let Some(power) = self.tx_start_charge {
                    connector.power_offered = power;
                    connector.update_status();
                }
            }
            state
                .transaction_connector
                .insert(response.transaction_id, connector_id);
        }

        sleep(self.settle_delay).await;
        self.send_status_notification(connector_id).await
    }

    /// Stop the transaction on a connector, using the pending-stop snapshot
    /// when the connector was already unplugged.
    pub async fn send_stop_transaction(
        &self,
        connector_id: u32,
        reason: Option<Reason>,
    ) -> Result<(), StationError> {
        let (transaction_id, id_tag, meter_stop, from_snapshot) = {
            let state = self.state.lock();
            let connector = state.connector(connector_id)?;
            match &connector.pending_stop_tx {
                Some(snapshot) => match snapshot.transaction_id {
                    Some(transaction_id) => (
                        transaction_id,
                        snapshot.id_tag.clone(),
                        snapshot.energy_import_register.round() as i32,
                        true,
                    ),
                    None => {
                        warn!(connector_id, "Pending stop snapshot has no transaction id");
                        return Ok(());
                    }
                },
                None => match connector.transaction_id {
                    Some(transaction_id) => (
                        transaction_id,
                        connector.id_tag.clone(),
                        connector.energy_import_register.round() as i32,
                        false,
                    ),
                    None => {
                        warn!(connector_id, "No transaction to stop");
                        return Ok(());
                    }
                },
            }
        };

        let request = StopTransactionRequest {
            transaction_id,
            id_tag,
            meter_stop,
            timestamp: Utc::now().trunc_subsecs(0),
            reason,
            transaction_data: None,
        };

        debug!(connector_id, transaction_id, "Sending StopTransaction");
        let _: StopTransactionResponse = self.link.request("StopTransaction", &request).await?;

        {
            let mut state = self.state.lock();
            state.transaction_connector.remove(&transaction_id);
            let connector = state.connector_mut(connector_id)?;
            if from_snapshot {
                connector.reset(false);
            } else {
                connector.already_stopped = true;
            }
        }

        if !from_snapshot {
            self.change_status(connector_id, ChargePointStatus::Finishing)
                .await?;
        }
        Ok(())
    }

    /// Unplug a connector. With `stop_tx` an owed StopTransaction is sent
    /// first; without it the transaction snapshot is kept for later.
    pub async fn unplug(&self, connector_id: u32, stop_tx: bool) -> Result<(), StationError> {
        let (plugged_in, already_stopped) = {
            let state = self.state.lock();
            let connector = state.connector(connector_id)?;
            (connector.plugged_in, connector.already_stopped)
        };

        if !plugged_in {
            warn!(connector_id, "Connector already unplugged");
            return Ok(());
        }

        if !already_stopped && stop_tx {
            self.send_stop_transaction(connector_id, Some(Reason::EVDisconnected))
                .await?;
            self.send_status_notification(connector_id).await?;
            sleep(self.settle_delay).await;
        }

        info!(connector_id, "Unplugging");
        self.state
            .lock()
            .connector_mut(connector_id)?
            .reset(!stop_tx);
        self.send_status_notification(connector_id).await
    }

    /// Report a connector's status; id 0 reports every connector in order.
    pub async fn send_status_notification(&self, connector_id: u32) -> Result<(), StationError> {
        if connector_id == WILDCARD_CONNECTOR_ID {
            debug!("Sending StatusNotification for all connectors");
            return self.announce_connectors().await.map_err(StationError::from);
        }

        let (error_code, status) = {
            let state = self.state.lock();
            let connector = state.connector(connector_id)?;
            (connector.error_code, connector.status)
        };
        self.push_status_notification(connector_id, error_code, status)
            .await
            .map_err(StationError::from)
    }

    async fn announce_connectors(&self) -> Result<(), ProtocolError> {
        let reports: Vec<(u32, ChargePointErrorCode, ChargePointStatus)> = {
            let state = self.state.lock();
            state
                .connectors
                .values()
                .map(|c| (c.id, c.error_code, c.status))
                .collect()
        };
        for (connector_id, error_code, status) in reports {
            self.push_status_notification(connector_id, error_code, status)
                .await?;
        }
        Ok(())
    }

    async fn push_status_notification(
        &self,
        connector_id: u32,
        error_code: ChargePointErrorCode,
        status: ChargePointStatus,
    ) -> Result<(), ProtocolError> {
        debug!(connector_id, status = %status, "Sending StatusNotification");
        let request = StatusNotificationRequest {
            connector_id,
            error_code,
            status,
            info: None,
            timestamp: None,
            vendor_id: None,
            vendor_error_code: None,
        };
        let _: StatusNotificationResponse =
            self.link.request("StatusNotification", &request).await?;
        Ok(())
    }

    /// Assign a new status and notify the CSMS when it actually changed.
    pub async fn change_status(
        &self,
        connector_id: u32,
        new_status: ChargePointStatus,
    ) -> Result<(), StationError> {
        let changed = {
            let mut state = self.state.lock();
            let connector = state.connector_mut(connector_id)?;
            if connector.status != new_status {
                connector.status = new_status;
                true
            } else {
                false
            }
        };

        if changed {
            self.send_status_notification(connector_id).await?;
        }
        Ok(())
    }

    /// Forward an arbitrary JSON payload to the CSMS as a DataTransfer.
    pub async fn send_data_transfer(&self, payload: &Value) -> Result<Value, StationError> {
        let request = DataTransferRequest {
            vendor_id: self.vendor.clone(),
            message_id: None,
            data: Some(payload.to_string()),
        };
        debug!("Sending DataTransfer");
        let payload = serde_json::to_value(&request).map_err(|e| ProtocolError::Encode {
            action: "DataTransfer".to_string(),
            source: e,
        })?;
        Ok(self.link.call("DataTransfer", payload).await?)
    }

    /// Apply a one-period TxProfile the way a CSMS-sent SetChargingProfile
    /// would, including the follow-up status notification.
    pub async fn set_charging_profile(
        &self,
        connector_id: u32,
        limit: f64,
    ) -> Result<(), StationError> {
        let profile = charging_profile_with_limit(limit);
        let status = self.apply_charging_profile(connector_id, &profile)?;
        if status != ChargingProfileStatus::Accepted {
            return Err(StationError::NotReadyToCharge);
        }
        self.notify_power_status(connector_id).await
    }

    fn apply_charging_profile(
        &self,
        connector_id: u32,
        profile: &ChargingProfile,
    ) -> Result<ChargingProfileStatus, StationError> {
        let mut state = self.state.lock();
        let connector = state.connector_mut(connector_id)?;

        if !connector.ready_to_charge() {
            warn!(connector_id, "Unable to set charging profile: not ready to charge");
            return Ok(ChargingProfileStatus::Rejected);
        }

        match profile.charging_schedule.charging_schedule_period.first() {
            Some(period) => {
                connector.power_offered = period.limit;
                Ok(ChargingProfileStatus::Accepted)
            }
            None => {
                warn!(connector_id, "Charging profile carries no schedule period");
                Ok(ChargingProfileStatus::Rejected)
            }
        }
    }

    /// Re-derive the status from the offered power and notify on change.
    async fn notify_power_status(&self, connector_id: u32) -> Result<(), StationError> {
        let changed = {
            let mut state = self.state.lock();
            match state.connectors.get_mut(&connector_id) {
                Some(connector) => connector.update_status(),
                None => false,
            }
        };

        if changed {
            self.send_status_notification(connector_id).await?;
        }
        Ok(())
    }

    // ── Inbound handlers ───────────────────────────────────

    pub(crate) async fn on_remote_start_transaction(
        &self,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let request: RemoteStartTransactionRequest = decode("RemoteStartTransaction", payload)?;
        info!(
            connector_id = ?request.connector_id,
            id_tag = %request.id_tag,
            "Remote start transaction requested"
        );

        let status = match request.connector_id {
            None => RemoteStartStopStatus::Rejected,
            Some(connector_id) => {
                let mut state = self.state.lock();
                match state.connectors.get_mut(&connector_id) {
                    Some(connector) => {
                        connector.id_tag = Some(request.id_tag.clone());
                        RemoteStartStopStatus::Accepted
                    }
                    None => RemoteStartStopStatus::Rejected,
                }
            }
        };

        Ok(encode(&RemoteStartTransactionResponse { status }))
    }

    pub(crate) async fn after_remote_start_transaction(&self, payload: &Value) {
        let Ok(request) =
            serde_json::from_value::<RemoteStartTransactionRequest>(payload.clone())
        else {
            return;
        };
        let connector_id = request.connector_id.unwrap_or(1);

        let has_tag = {
            let state = self.state.lock();
            state
                .connectors
                .get(&connector_id)
                .map(|c| c.id_tag.is_some())
                .unwrap_or(false)
        };
        if !has_tag {
            return;
        }

        if let Err(e) = self.send_start_transaction(connector_id).await {
            warn!(connector_id, error = %e, "StartTransaction after remote start failed");
        }
    }

    pub(crate) async fn on_remote_stop_transaction(
        &self,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let transaction_id = remote_stop_transaction_id(payload);
        info!(?transaction_id, "Remote stop transaction requested");

        let known = match transaction_id {
            Some(transaction_id) => self
                .state
                .lock()
                .transaction_connector
                .contains_key(&transaction_id),
            None => false,
        };

        let status = if known {
            RemoteStartStopStatus::Accepted
        } else {
            RemoteStartStopStatus::Rejected
        };
        Ok(encode(&RemoteStopTransactionResponse { status }))
    }

    pub(crate) async fn after_remote_stop_transaction(&self, payload: &Value) {
        let Some(transaction_id) = remote_stop_transaction_id(payload) else {
            return;
        };
        let connector_id = {
            let state = self.state.lock();
            state.transaction_connector.get(&transaction_id).copied()
        };
        let Some(connector_id) = connector_id else {
            return;
        };

        if let Err(e) = self.send_stop_transaction(connector_id, None).await {
            warn!(connector_id, error = %e, "StopTransaction after remote stop failed");
        }
    }

    pub(crate) async fn on_get_configuration(
        &self,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let request: GetConfigurationRequest = decode("GetConfiguration", payload)?;
        let state = self.state.lock();

        let response = match request.key {
            None => GetConfigurationResponse {
                configuration_key: Some(
                    state
                        .configuration
                        .iter()
                        .map(|(key, value)| KeyValue {
                            key: key.clone(),
                            readonly: false,
                            value: Some(value.clone()),
                        })
                        .collect(),
                ),
                unknown_key: None,
            },
            Some(keys) => {
                let mut configuration_key = Vec::new();
                let mut unknown_key = Vec::new();
                for key in keys {
                    match state.configuration.get(&key) {
                        Some(value) => configuration_key.push(KeyValue {
                            key,
                            readonly: false,
                            value: Some(value.clone()),
                        }),
                        None => unknown_key.push(key),
                    }
                }
                GetConfigurationResponse {
                    configuration_key: Some(configuration_key),
                    unknown_key: Some(unknown_key),
                }
            }
        };

        Ok(encode(&response))
    }

    pub(crate) async fn on_change_configuration(
        &self,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let request: ChangeConfigurationRequest = decode("ChangeConfiguration", payload)?;
        info!(key = %request.key, value = %request.value, "Changing configuration");

        self.state
            .lock()
            .configuration
            .insert(request.key, request.value);

        Ok(encode(&ChangeConfigurationResponse {
            status: ConfigurationStatus::Accepted,
        }))
    }

    pub(crate) async fn on_change_availability(
        &self,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let _: ChangeAvailabilityRequest = decode("ChangeAvailability", payload)?;
        Ok(encode(&ChangeAvailabilityResponse {
            status: AvailabilityStatus::Accepted,
        }))
    }

    pub(crate) async fn after_change_availability(&self, payload: &Value) {
        let Ok(request) = serde_json::from_value::<ChangeAvailabilityRequest>(payload.clone())
        else {
            return;
        };

        let changed = {
            let mut state = self.state.lock();
            match state.connectors.get_mut(&request.connector_id) {
                Some(connector) => connector.change_availability(request.kind),
                None => {
                    warn!(
                        connector_id = request.connector_id,
                        "ChangeAvailability for unknown connector"
                    );
                    false
                }
            }
        };

        if changed {
            if let Err(e) = self.send_status_notification(request.connector_id).await {
                warn!(error = %e, "StatusNotification after availability change failed");
            }
        }
    }

    pub(crate) async fn on_set_charging_profile(
        &self,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let request: SetChargingProfileRequest = decode("SetChargingProfile", payload)?;

        let status = match self
            .apply_charging_profile(request.connector_id, &request.cs_charging_profiles)
        {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    connector_id = request.connector_id,
                    "SetChargingProfile for unknown connector"
                );
                ChargingProfileStatus::Rejected
            }
        };

        Ok(encode(&SetChargingProfileResponse { status }))
    }

    pub(crate) async fn after_set_charging_profile(&self, payload: &Value) {
        let Ok(request) = serde_json::from_value::<SetChargingProfileRequest>(payload.clone())
        else {
            return;
        };
        if let Err(e) = self.notify_power_status(request.connector_id).await {
            warn!(error = %e, "StatusNotification after charging profile failed");
        }
    }

    // ── Background loops ───────────────────────────────────

    fn configured_secs(&self, key: &str, default: u64) -> u64 {
        let state = self.state.lock();
        match state.configuration.get(key).map(|v| v.parse::<u64>()) {
            Some(Ok(secs)) => secs,
            Some(Err(_)) => {
                warn!(key, "Configuration value is not a number, using default");
                default
            }
            None => default,
        }
    }
}

#[async_trait]
impl InboundDispatch for ChargingStation {
    async fn on_call(&self, action: &str, payload: &Value) -> Result<Value, DispatchError> {
        match routes::lookup(action) {
            Some(route) => (route.on)(self, payload).await,
            None => Err(DispatchError::NotImplemented(action.to_string())),
        }
    }

    /// After-hooks may issue further calls whose replies come through the
    /// receiver, so they run as their own task rather than on the receiver.
    async fn after_call(&self, action: &str, payload: &Value) {
        let Some(routes::Route {
            after: Some(after), ..
        }) = routes::lookup(action)
        else {
            return;
        };
        if let Some(station) = self.self_ref.upgrade() {
            tokio::spawn(after(station, payload.clone()));
        }
    }
}

// ── Helper functions ───────────────────────────────────────────

fn decode<T: serde::de::DeserializeOwned>(
    action: &str,
    payload: &Value,
) -> Result<T, DispatchError> {
    serde_json::from_value(payload.clone()).map_err(|e| DispatchError::Malformed {
        action: action.to_string(),
        source: e,
    })
}

fn encode<T: Serialize>(reply: &T) -> Value {
    serde_json::to_value(reply).unwrap_or_default()
}

/// The transaction id of a RemoteStopTransaction, whether the backend sends
/// it as a JSON number or as a decimal string.
fn remote_stop_transaction_id(payload: &Value) -> Option<i32> {
    match payload.get("transactionId") {
        Some(Value::Number(n)) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Single-period TxProfile used by the control surface and quick start.
fn charging_profile_with_limit(limit: f64) -> ChargingProfile {
    ChargingProfile {
        charging_profile_id: 1,
        transaction_id: None,
        stack_level: 0,
        charging_profile_purpose: ChargingProfilePurpose::TxProfile,
        charging_profile_kind: ChargingProfileKind::Relative,
        recurrency_kind: None,
        valid_from: None,
        valid_to: None,
        charging_schedule: ChargingSchedule {
            duration: None,
            start_schedule: None,
            charging_rate_unit: ChargingRateUnit::W,
            charging_schedule_period: vec![ChargingSchedulePeriod {
                start_period: 0,
                limit,
                number_phases: None,
            }],
            min_charging_rate: None,
        },
    }
}

async fn writer_loop(
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut sink: SplitSink<WsStream, Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn receiver_loop(station: Arc<ChargingStation>, mut stream: SplitStream<WsStream>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                station.link.handle_incoming(&text, station.as_ref()).await;
            }
            Ok(Message::Close(_)) => {
                info!(cs_id = %station.cs_id, "CSMS closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(cs_id = %station.cs_id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    // The transport is gone: every in-flight call reports absence.
    station.link.abort_pending();
    station.connected.store(false, Ordering::SeqCst);
}

async fn heartbeat_loop(station: Arc<ChargingStation>) {
    info!("Starting heartbeat loop");
    sleep(HEARTBEAT_STARTUP_DELAY).await;
    loop {
        let beat: Result<HeartbeatResponse, ProtocolError> =
            station.link.request("Heartbeat", &HeartbeatRequest {}).await;
        if let Err(e) = beat {
            warn!(error = %e, "Heartbeat failed, stopping loop");
            return;
        }

        let interval =
            station.configured_secs("HeartbeatInterval", DEFAULT_HEARTBEAT_INTERVAL_SECS);
        sleep(Duration::from_secs(interval)).await;
    }
}

/// Emit meter values for every charging connector, then sleep for the
/// configured sample interval. The interval is re-read every cycle so a
/// live ChangeConfiguration takes effect on the next one.
async fn meter_value_loop(station: Arc<ChargingStation>) {
    info!("Starting meter values loop");
    loop {
        let batch: Vec<MeterValuesRequest> = {
            let mut state = station.state.lock();
            state
                .connectors
                .values_mut()
                .filter(|c| c.status == ChargePointStatus::Charging)
                .map(|connector| {
                    connector.consume_energy();
                    MeterValuesRequest {
                        connector_id: connector.id,
                        transaction_id: connector.transaction_id,
                        meter_value: meter_values::generate_meter_values(
                            connector.power_offered,
                            connector.energy_import_register,
                        ),
                    }
                })
                .collect()
        };

        for request in batch {
            let connector_id = request.connector_id;
            let sent: Result<MeterValuesResponse, ProtocolError> =
                station.link.request("MeterValues", &request).await;
            if let Err(e) = sent {
                warn!(connector_id, error = %e, "MeterValues failed, stopping loop");
                return;
            }
        }

        let interval = station.configured_secs(
            "MeterValueSampleInterval",
            DEFAULT_METER_SAMPLE_INTERVAL_SECS,
        );
        sleep(Duration::from_secs(interval)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::OcppFrame;
    use serde_json::json;

    /// In-process CSMS stand-in: answers every outbound call with a canned
    /// reply and records what the station sent.
    struct Harness {
        station: Arc<ChargingStation>,
        calls: Arc<Mutex<Vec<(String, Value)>>>,
    }

    fn canned_reply(action: &str) -> Value {
        match action {
            "BootNotification" => json!({
                "status": "Accepted",
                "currentTime": "2024-01-01T00:00:00Z",
                "interval": 300,
            }),
            "Authorize" => json!({"idTagInfo": {"status": "Accepted"}}),
            "StartTransaction" => json!({
                "transactionId": 7,
                "idTagInfo": {"status": "Accepted"},
            }),
            "StopTransaction" => json!({"idTagInfo": {"status": "Accepted"}}),
            "Heartbeat" => json!({"currentTime": "2024-01-01T00:00:00Z"}),
            "DataTransfer" => json!({"status": "Accepted"}),
            _ => json!({}),
        }
    }

    fn spawn_harness(mut config: StationConfig) -> Harness {
        config.settle_delay = Duration::from_millis(5);
        let station = ChargingStation::new(config);
        let mut outbound = station.outbound_rx.lock().take().unwrap();
        let calls: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));

        let pump_station = station.clone();
        let pump_calls = calls.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let Message::Text(text) = message else { break };
                let Ok(OcppFrame::Call {
                    unique_id,
                    action,
                    payload,
                }) = OcppFrame::parse(&text)
                else {
                    continue;
                };
                pump_calls.lock().push((action.clone(), payload));
                let reply = OcppFrame::call_result(&unique_id, canned_reply(&action));
                pump_station
                    .link
                    .handle_incoming(&reply.serialize(), pump_station.as_ref())
                    .await;
            }
        });

        Harness { station, calls }
    }

    impl Harness {
        fn actions(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(a, _)| a.clone()).collect()
        }

        fn payload_of(&self, action: &str) -> Option<Value> {
            self.calls
                .lock()
                .iter()
                .find(|(a, _)| a == action)
                .map(|(_, p)| p.clone())
        }
    }

    fn test_config() -> StationConfig {
        StationConfig::new("cs-under-test", "VendorX", "ModelY")
    }

    #[tokio::test]
    async fn plug_in_with_rfid_starts_a_transaction() {
        let harness = spawn_harness(test_config());
        harness.station.plug_in(1, Some("04E1")).await.unwrap();

        let actions = harness.actions();
        assert_eq!(
            actions,
            vec![
                "StatusNotification", // Preparing after plug in
                "Authorize",
                "StartTransaction",
                "StatusNotification", // settle notification
            ]
        );

        let snapshot = harness.station.snapshot();
        assert_eq!(snapshot.connectors[0].transaction_id, Some(7));
        assert!(!snapshot.connectors[0].already_stopped);
        assert_eq!(snapshot.transactions.get(&7), Some(&1));
        assert_eq!(snapshot.connectors[0].status, ChargePointStatus::Preparing);
    }

    #[tokio::test]
    async fn auth_start_without_plug_is_rejected_locally() {
        let harness = spawn_harness(test_config());
        let err = harness
            .station
            .send_auth_start(1, "04E1")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Request rejected by the CS: Unable to authorize when nothing is plugged in"
        );
        assert!(harness.actions().is_empty());
    }

    #[tokio::test]
    async fn unplug_without_stop_keeps_a_snapshot_for_the_late_stop() {
        let harness = spawn_harness(test_config());
        harness.station.plug_in(1, Some("abc")).await.unwrap();

        // Simulate metered consumption before the unplug.
        harness
            .station
            .state
            .lock()
            .connector_mut(1)
            .unwrap()
            .energy_import_register = 123.4;

        harness.station.unplug(1, false).await.unwrap();
        {
            let snapshot = harness.station.snapshot();
            let connector = &snapshot.connectors[0];
            assert_eq!(
                connector.pending_stop_tx,
                Some(PendingStopTx {
                    id_tag: Some("abc".into()),
                    transaction_id: Some(7),
                    energy_import_register: 123.4,
                })
            );
            assert!(connector.id_tag.is_none());
            assert!(connector.transaction_id.is_none());
            assert_eq!(connector.status, ChargePointStatus::Available);
            // The transaction is still owed, so the index keeps it.
            assert_eq!(snapshot.transactions.get(&7), Some(&1));
        }

        harness.station.send_stop_transaction(1, None).await.unwrap();
        let stop = harness.payload_of("StopTransaction").unwrap();
        assert_eq!(stop["transactionId"], 7);
        assert_eq!(stop["idTag"], "abc");
        assert_eq!(stop["meterStop"], 123);

        let snapshot = harness.station.snapshot();
        assert!(snapshot.connectors[0].pending_stop_tx.is_none());
        assert!(snapshot.transactions.is_empty());
        assert_eq!(snapshot.connectors[0].status, ChargePointStatus::Available);
    }

    #[tokio::test]
    async fn stop_transaction_reports_finishing_and_clears_the_index() {
        let harness = spawn_harness(test_config());
        harness.station.plug_in(1, Some("abc")).await.unwrap();

        harness
            .station
            .send_stop_transaction(1, Some(Reason::EVDisconnected))
            .await
            .unwrap();

        let stop = harness.payload_of("StopTransaction").unwrap();
        assert_eq!(stop["reason"], "EVDisconnected");

        let snapshot = harness.station.snapshot();
        assert!(snapshot.transactions.is_empty());
        assert!(snapshot.connectors[0].already_stopped);
        assert_eq!(snapshot.connectors[0].status, ChargePointStatus::Finishing);
    }

    #[tokio::test]
    async fn remote_stop_accepts_numeric_and_string_transaction_ids() {
        let harness = spawn_harness(test_config());
        harness.station.plug_in(1, Some("abc")).await.unwrap();

        let reply = harness
            .station
            .on_remote_stop_transaction(&json!({"transactionId": "7"}))
            .await
            .unwrap();
        assert_eq!(reply["status"], "Accepted");

        let reply = harness
            .station
            .on_remote_stop_transaction(&json!({"transactionId": 999}))
            .await
            .unwrap();
        assert_eq!(reply["status"], "Rejected");

        harness
            .station
            .after_remote_stop_transaction(&json!({"transactionId": "7"}))
            .await;
        assert!(harness.payload_of("StopTransaction").is_some());
    }

    #[tokio::test]
    async fn remote_start_without_connector_id_is_rejected() {
        let harness = spawn_harness(test_config());
        let reply = harness
            .station
            .on_remote_start_transaction(&json!({"idTag": "04E1"}))
            .await
            .unwrap();
        assert_eq!(reply["status"], "Rejected");
    }

    #[tokio::test]
    async fn get_configuration_splits_known_and_unknown_keys() {
        let harness = spawn_harness(test_config());

        let all = harness
            .station
            .on_get_configuration(&json!({}))
            .await
            .unwrap();
        let entries = all["configurationKey"].as_array().unwrap();
        assert_eq!(entries.len(), 5);
        assert!(all.get("unknownKey").is_none());

        let filtered = harness
            .station
            .on_get_configuration(&json!({"key": ["HeartbeatInterval", "Bogus"]}))
            .await
            .unwrap();
        assert_eq!(
            filtered["configurationKey"],
            json!([{"key": "HeartbeatInterval", "readonly": false, "value": "600"}])
        );
        assert_eq!(filtered["unknownKey"], json!(["Bogus"]));
    }

    #[tokio::test]
    async fn set_charging_profile_rejected_until_ready_to_charge() {
        let harness = spawn_harness(test_config());
        let payload = json!({
            "connectorId": 1,
            "csChargingProfiles": {
                "chargingProfileId": 1,
                "stackLevel": 0,
                "chargingProfilePurpose": "TxProfile",
                "chargingProfileKind": "Relative",
                "chargingSchedule": {
                    "chargingRateUnit": "W",
                    "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 500.0}]
                }
            }
        });

        let reply = harness
            .station
            .on_set_charging_profile(&payload)
            .await
            .unwrap();
        assert_eq!(reply["status"], "Rejected");

        harness.station.plug_in(1, None).await.unwrap();
        let reply = harness
            .station
            .on_set_charging_profile(&payload)
            .await
            .unwrap();
        assert_eq!(reply["status"], "Accepted");

        harness.station.after_set_charging_profile(&payload).await;
        let snapshot = harness.station.snapshot();
        assert_eq!(snapshot.connectors[0].power_offered, 500.0);
        assert_eq!(snapshot.connectors[0].status, ChargePointStatus::Charging);
    }

    #[tokio::test]
    async fn control_surface_profile_rejection_is_user_readable() {
        let harness = spawn_harness(test_config());
        let err = harness
            .station
            .set_charging_profile(1, 99.0)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to set charging profile: connector not ready to charge"
        );
    }

    #[tokio::test]
    async fn change_availability_latch_round_trip() {
        let harness = spawn_harness(test_config());
        harness.station.plug_in(1, Some("abc")).await.unwrap();

        // Busy connector: the change is latched, no notification yet.
        harness
            .station
            .after_change_availability(&json!({"connectorId": 1, "type": "Inoperative"}))
            .await;
        assert_eq!(
            harness.station.snapshot().connectors[0].status,
            ChargePointStatus::Preparing
        );

        // Unplugging resets the connector, which honours the latch.
        harness.station.unplug(1, true).await.unwrap();
        assert_eq!(
            harness.station.snapshot().connectors[0].status,
            ChargePointStatus::Unavailable
        );

        harness
            .station
            .after_change_availability(&json!({"connectorId": 1, "type": "Operative"}))
            .await;
        assert_eq!(
            harness.station.snapshot().connectors[0].status,
            ChargePointStatus::Available
        );
    }

    #[tokio::test]
    async fn data_transfer_wraps_the_payload_as_json_text() {
        let harness = spawn_harness(test_config());
        harness
            .station
            .send_data_transfer(&json!({"foo": "bar"}))
            .await
            .unwrap();

        let sent = harness.payload_of("DataTransfer").unwrap();
        assert_eq!(sent["vendorId"], "VendorX");
        assert_eq!(sent["data"], r#"{"foo":"bar"}"#);
    }

    #[tokio::test]
    async fn unknown_connector_is_a_not_found_error() {
        let harness = spawn_harness(test_config());
        assert!(matches!(
            harness.station.plug_in(9, None).await,
            Err(StationError::UnknownConnector(9))
        ));
    }
}
