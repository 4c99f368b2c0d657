//! OCPP-J message framing.
//!
//! Every OCPP 1.6-J message travels as a JSON array:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use thiserror::Error;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum OcppFrame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("OCPP message is not a non-empty array")]
    NotAnArray,
    #[error("message type is not a number")]
    InvalidMessageType,
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },
    #[error("{0} must be a string")]
    FieldTypeMismatch(&'static str),
}

impl OcppFrame {
    /// Build an outbound Call frame.
    pub fn call(unique_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self::Call {
            unique_id: unique_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Build a CallResult reply for a received Call.
    pub fn call_result(unique_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    /// Build a CallError reply with empty error details.
    pub fn call_error(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }

    /// Parse a raw JSON text into a frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

        let msg_type = match arr.first() {
            Some(v) => v.as_u64().ok_or(FrameError::InvalidMessageType)?,
            None => return Err(FrameError::NotAnArray),
        };

        match msg_type {
            MSG_TYPE_CALL => {
                require_len(&arr, 4)?;
                Ok(Self::Call {
                    unique_id: string_field(&arr[1], "uniqueId")?,
                    action: string_field(&arr[2], "action")?,
                    payload: arr[3].clone(),
                })
            }
            MSG_TYPE_CALL_RESULT => {
                require_len(&arr, 3)?;
                Ok(Self::CallResult {
                    unique_id: string_field(&arr[1], "uniqueId")?,
                    payload: arr[2].clone(),
                })
            }
            MSG_TYPE_CALL_ERROR => {
                require_len(&arr, 4)?;
                Ok(Self::CallError {
                    unique_id: string_field(&arr[1], "uniqueId")?,
                    error_code: arr[2].as_str().unwrap_or("InternalError").to_string(),
                    error_description: arr[3].as_str().unwrap_or("").to_string(),
                    error_details: arr
                        .get(4)
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Serialize this frame to wire text.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                MSG_TYPE_CALL.into(),
                unique_id.clone().into(),
                action.clone().into(),
                payload.clone(),
            ]),
            Self::CallResult { unique_id, payload } => Value::Array(vec![
                MSG_TYPE_CALL_RESULT.into(),
                unique_id.clone().into(),
                payload.clone(),
            ]),
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                MSG_TYPE_CALL_ERROR.into(),
                unique_id.clone().into(),
                error_code.clone().into(),
                error_description.clone().into(),
                error_details.clone(),
            ]),
        };

        // serializing a Value never fails
        serde_json::to_string(&arr).unwrap_or_default()
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }
}

fn require_len(arr: &[Value], expected: usize) -> Result<(), FrameError> {
    if arr.len() < expected {
        return Err(FrameError::MissingFields {
            expected,
            got: arr.len(),
        });
    }
    Ok(())
}

fn string_field(value: &Value, name: &'static str) -> Result<String, FrameError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(FrameError::FieldTypeMismatch(name))
}
