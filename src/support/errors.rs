//! Error types surfaced by the charging station simulator.
//!
//! Three kinds of failures exist:
//!
//! - [`BootstrapError`]: the WebSocket session with the CSMS could not be
//!   established, or boot was denied.
//! - [`RejectedRequest`]: a user-actionable rejection, tagged with the side
//!   that refused (the CS itself or the CSMS).
//! - [`ProtocolError`]: an OCPP call produced no usable reply.

use std::fmt;

use thiserror::Error;

/// Failure to establish the OCPP session at boot time.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("could not build the WebSocket handshake request: {0}")]
    BadRequest(String),

    #[error("server rejected the WebSocket connection to {url}: {reason}. Is this CS configured in the CSMS?")]
    Connect { url: String, reason: String },

    #[error("BootNotification was not accepted by the CSMS")]
    Denied,

    #[error("boot sequence failed: {0}")]
    Boot(#[from] ProtocolError),

    #[error("the charging station was already started")]
    AlreadyStarted,
}

/// The side that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectSource {
    Cs,
    Csms,
}

impl fmt::Display for RejectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cs => write!(f, "CS"),
            Self::Csms => write!(f, "CSMS"),
        }
    }
}

/// A request that was rejected either by local policy or by the backend.
#[derive(Debug, Error)]
#[error("Request rejected by the {side}: {message}")]
pub struct RejectedRequest {
    pub side: RejectSource,
    pub message: String,
}

impl RejectedRequest {
    pub fn cs(message: impl Into<String>) -> Self {
        Self {
            side: RejectSource::Cs,
            message: message.into(),
        }
    }

    pub fn csms(message: impl Into<String>) -> Self {
        Self {
            side: RejectSource::Csms,
            message: message.into(),
        }
    }
}

/// An OCPP call that did not yield a usable reply.
///
/// `NoReply` is the "absent response" signal: the link was torn down while
/// the call was in flight. There is no per-call timeout; absence only
/// materializes when the transport goes away.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no reply from the CSMS")]
    NoReply,

    #[error("CSMS returned CallError {code}: {description}")]
    CallError { code: String, description: String },

    #[error("could not encode {action} payload: {source}")]
    Encode {
        action: String,
        source: serde_json::Error,
    },

    #[error("could not decode {action} reply: {source}")]
    Decode {
        action: String,
        source: serde_json::Error,
    },
}

/// Errors surfaced by operator-facing station operations.
#[derive(Debug, Error)]
pub enum StationError {
    #[error("connector {0} does not exist")]
    UnknownConnector(u32),

    #[error("Unable to set charging profile: connector not ready to charge")]
    NotReadyToCharge,

    #[error(transparent)]
    Rejected(#[from] RejectedRequest),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_messages_name_the_refusing_side() {
        let cs = RejectedRequest::cs("Unable to authorize when nothing is plugged in");
        assert_eq!(
            cs.to_string(),
            "Request rejected by the CS: Unable to authorize when nothing is plugged in"
        );

        let csms = RejectedRequest::csms("Could not authorize RFID: 1234");
        assert_eq!(
            csms.to_string(),
            "Request rejected by the CSMS: Could not authorize RFID: 1234"
        );
    }

    #[test]
    fn charging_profile_rejection_is_user_readable() {
        assert_eq!(
            StationError::NotReadyToCharge.to_string(),
            "Unable to set charging profile: connector not ready to charge"
        );
    }
}
