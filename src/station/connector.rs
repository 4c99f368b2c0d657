//! Per-outlet connector state.
//!
//! A connector is pure state: the station core mutates it under its state
//! lock and decides which OCPP messages to emit based on the returned flags.

use serde::Serialize;
use tracing::info;

use crate::ocpp::types::{AvailabilityType, ChargePointErrorCode, ChargePointStatus};

/// Transaction snapshot kept when a connector is unplugged before its
/// StopTransaction has been sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingStopTx {
    pub id_tag: Option<String>,
    pub transaction_id: Option<i32>,
    pub energy_import_register: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Connector {
    pub id: u32,
    pub status: ChargePointStatus,
    pub error_code: ChargePointErrorCode,
    pub plugged_in: bool,
    /// True when no StopTransaction is owed for this connector.
    pub already_stopped: bool,
    pub id_tag: Option<String>,
    pub transaction_id: Option<i32>,
    pub energy_import_register: f64,
    pub power_offered: f64,
    pub pending_stop_tx: Option<PendingStopTx>,
    pub change_to_unavailable: bool,
}

impl Connector {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            status: ChargePointStatus::Available,
            error_code: ChargePointErrorCode::NoError,
            plugged_in: false,
            already_stopped: true,
            id_tag: None,
            transaction_id: None,
            energy_import_register: 0.0,
            power_offered: 0.0,
            pending_stop_tx: None,
            change_to_unavailable: false,
        }
    }

    /// Whether a transaction is live on this connector.
    pub fn live_transaction(&self) -> bool {
        self.transaction_id.is_some() && !self.already_stopped
    }

    /// Return the connector to its resting shape.
    ///
    /// With `postpone_stop_tx` the transaction triplet is captured into
    /// `pending_stop_tx` first, so a later StopTransaction can still report
    /// it. The deferred-unavailability latch decides the resting status.
    pub fn reset(&mut self, postpone_stop_tx: bool) {
        self.pending_stop_tx = if postpone_stop_tx && self.live_transaction() {
            Some(PendingStopTx {
                id_tag: self.id_tag.take(),
                transaction_id: self.transaction_id.take(),
                energy_import_register: self.energy_import_register,
            })
        } else {
            None
        };

        self.id_tag = None;
        self.transaction_id = None;
        self.energy_import_register = 0.0;
        self.power_offered = 0.0;
        self.error_code = ChargePointErrorCode::NoError;
        self.plugged_in = false;
        self.already_stopped = true;

        self.status = if self.change_to_unavailable {
            ChargePointStatus::Unavailable
        } else {
            ChargePointStatus::Available
        };
    }

    /// A connector accepts a charging profile only while an EV is plugged in
    /// and the session has not started charging yet.
    pub fn ready_to_charge(&self) -> bool {
        self.status == ChargePointStatus::Preparing && self.plugged_in
    }

    /// Accumulate one meter tick worth of energy. Only positive offered
    /// power contributes; the suspension sentinels leave the register alone.
    pub fn consume_energy(&mut self) {
        self.energy_import_register += self.power_offered.max(0.0);
    }

    /// Derive the status implied by the offered power and apply it.
    ///
    /// Returns whether the status actually changed, so the caller knows
    /// whether a StatusNotification is due.
    pub fn update_status(&mut self) -> bool {
        let target = match self.power_offered {
            p if p == 0.0 => ChargePointStatus::SuspendedEVSE,
            p if p == -1.0 => ChargePointStatus::SuspendedEV,
            p if p == -2.0 => ChargePointStatus::Finishing,
            _ => ChargePointStatus::Charging,
        };

        if self.status == target {
            return false;
        }

        info!(connector_id = self.id, status = %target, "Connector status change");
        self.status = target;
        true
    }

    /// Apply a ChangeAvailability request.
    ///
    /// Inoperative on a busy connector is latched and takes effect at the
    /// next `reset`. Returns whether the status changed now.
    pub fn change_availability(&mut self, availability: AvailabilityType) -> bool {
        match availability {
            AvailabilityType::Inoperative => {
                if self.status == ChargePointStatus::Available {
                    self.status = ChargePointStatus::Unavailable;
                    return true;
                }
                self.change_to_unavailable = true;
                false
            }
            AvailabilityType::Operative => {
                if self.status == ChargePointStatus::Unavailable {
                    self.status = ChargePointStatus::Available;
                    self.change_to_unavailable = false;
                    return true;
                }
                false
            }
        }
    }
}
