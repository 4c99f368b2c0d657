//! Shared OCPP 1.6 enumerations and compound types.
//!
//! Wire names follow the OCPP 1.6 specification; fields are camelCase on the
//! wire and optional fields are omitted entirely when unset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use strum::Display;

/// Connector status as reported in StatusNotification.req.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChargePointStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEVSE,
    SuspendedEV,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

/// Charge point error code as reported in StatusNotification.req.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChargePointErrorCode {
    ConnectorLockFailure,
    EVCommunicationError,
    GroundFailure,
    HighTemperature,
    InternalError,
    LocalListConflict,
    NoError,
    OtherError,
    OverCurrentFailure,
    PowerMeterFailure,
    PowerSwitchFailure,
    ReaderFailure,
    ResetFailure,
    UnderVoltage,
    OverVoltage,
    WeakSignal,
}

/// Registration outcome of a BootNotification.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Authorization outcome carried inside [`IdTagInfo`].
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

/// Reason a transaction was stopped.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    EmergencyStop,
    EVDisconnected,
    HardReset,
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
    DeAuthorized,
}

/// Requested availability in ChangeAvailability.req.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityType {
    Inoperative,
    Operative,
}

/// Reply status for ChangeAvailability.conf.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStatus {
    Accepted,
    Rejected,
    Scheduled,
}

/// Reply status for ChangeConfiguration.conf.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationStatus {
    Accepted,
    Rejected,
    RebootRequired,
    NotSupported,
}

/// Reply status for RemoteStart/RemoteStopTransaction.conf.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStartStopStatus {
    Accepted,
    Rejected,
}

/// Reply status for SetChargingProfile.conf.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChargingProfileStatus {
    Accepted,
    Rejected,
    NotSupported,
}

/// Reply status for DataTransfer.conf.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

/// Authorization details attached to Authorize/StartTransaction replies.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
    pub expiry_date: Option<DateTime<Utc>>,
    pub parent_id_tag: Option<String>,
}

/// One configuration entry in GetConfiguration.conf.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    pub readonly: bool,
    pub value: Option<String>,
}

// ── Meter values ───────────────────────────────────────────────

/// A bundle of sampled values taken at one instant.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_value: Vec<SampledValue>,
}

/// A single sampled reading.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    pub context: Option<ReadingContext>,
    pub measurand: Option<Measurand>,
    pub location: Option<Location>,
    pub unit: Option<UnitOfMeasure>,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ReadingContext {
    #[serde(rename = "Interruption.Begin")]
    InterruptionBegin,
    #[serde(rename = "Interruption.End")]
    InterruptionEnd,
    #[serde(rename = "Sample.Clock")]
    SampleClock,
    #[serde(rename = "Sample.Periodic")]
    SamplePeriodic,
    #[serde(rename = "Transaction.Begin")]
    TransactionBegin,
    #[serde(rename = "Transaction.End")]
    TransactionEnd,
    Trigger,
    Other,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Measurand {
    #[serde(rename = "Energy.Active.Import.Register")]
    EnergyActiveImportRegister,
    #[serde(rename = "Power.Active.Import")]
    PowerActiveImport,
    #[serde(rename = "Power.Offered")]
    PowerOffered,
    Voltage,
    SoC,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Body,
    Cable,
    EV,
    Inlet,
    Outlet,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfMeasure {
    Wh,
    W,
    V,
    Percent,
}

// ── Charging profiles ──────────────────────────────────────────

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub charging_profile_id: i32,
    pub transaction_id: Option<i32>,
    pub stack_level: u32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    pub recurrency_kind: Option<RecurrencyKind>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub charging_schedule: ChargingSchedule,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    pub duration: Option<u32>,
    pub start_schedule: Option<DateTime<Utc>>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    pub min_charging_rate: Option<f64>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    pub start_period: u32,
    pub limit: f64,
    pub number_phases: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChargingProfilePurpose {
    ChargePointMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RecurrencyKind {
    Daily,
    Weekly,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChargingRateUnit {
    A,
    W,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_wire_names_survive_the_round_trip() {
        let value = serde_json::to_value(ReadingContext::SamplePeriodic).unwrap();
        assert_eq!(value, json!("Sample.Periodic"));

        let measurand: Measurand = serde_json::from_value(json!("Power.Offered")).unwrap();
        assert_eq!(measurand, Measurand::PowerOffered);
    }

    #[test]
    fn optional_fields_are_omitted_when_unset() {
        let info = IdTagInfo {
            status: AuthorizationStatus::Accepted,
            expiry_date: None,
            parent_id_tag: None,
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"status": "Accepted"})
        );
    }

    #[test]
    fn charging_profile_deserializes_from_csms_shape() {
        let profile: ChargingProfile = serde_json::from_value(json!({
            "chargingProfileId": 1,
            "stackLevel": 0,
            "chargingProfilePurpose": "TxProfile",
            "chargingProfileKind": "Relative",
            "chargingSchedule": {
                "chargingRateUnit": "W",
                "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 500.0}]
            }
        }))
        .unwrap();
        assert_eq!(profile.charging_schedule.charging_schedule_period[0].limit, 500.0);
    }
}
