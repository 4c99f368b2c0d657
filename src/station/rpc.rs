//! OCPP JSON-RPC link.
//!
//! [`OcppLink`] owns both directions of the dialogue over one WebSocket:
//!
//! - outbound: [`OcppLink::call`] serializes a Call frame, parks a oneshot
//!   responder in the pending map keyed by the unique id, and resolves it
//!   when the matching CallResult/CallError arrives;
//! - inbound: [`OcppLink::handle_incoming`] parses a frame, settles pending
//!   calls, and routes Calls through the [`InboundDispatch`] seam, sending
//!   the CallResult before the after-hook runs.
//!
//! The link never imposes a per-call timeout. A call only fails once the
//! transport is torn down ([`OcppLink::abort_pending`] /
//! [`OcppLink::shutdown`] drop the parked responders).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ocpp::OcppFrame;
use crate::support::errors::ProtocolError;

/// Outcome of dispatching one inbound Call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("action {0} is not supported")]
    NotImplemented(String),

    #[error("malformed {action} payload: {source}")]
    Malformed {
        action: String,
        source: serde_json::Error,
    },
}

/// Inbound-call seam between the link and the station core.
///
/// `after_call` is only invoked when `on_call` produced a reply, and runs
/// after that reply has been handed to the writer.
#[async_trait]
pub trait InboundDispatch: Send + Sync {
    async fn on_call(&self, action: &str, payload: &Value) -> Result<Value, DispatchError>;
    async fn after_call(&self, action: &str, payload: &Value);
}

type PendingReply = oneshot::Sender<Result<Value, ProtocolError>>;

pub struct OcppLink {
    outbound: mpsc::UnboundedSender<Message>,
    pending: DashMap<String, PendingReply>,
}

impl OcppLink {
    /// Create a link and hand back the outbound frame stream for the caller
    /// to pump into a WebSocket sink.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound,
                pending: DashMap::new(),
            },
            rx,
        )
    }

    /// Issue a Call and wait for the matching reply payload.
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value, ProtocolError> {
        let unique_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(unique_id.clone(), tx);

        debug!(action, unique_id = %unique_id, "Sending call");
        let frame = OcppFrame::call(&unique_id, action, payload);
        if self
            .outbound
            .send(Message::Text(frame.serialize()))
            .is_err()
        {
            self.pending.remove(&unique_id);
            return Err(ProtocolError::NoReply);
        }

        match rx.await {
            Ok(outcome) => outcome,
            // The pending entry was dropped: link torn down mid-call.
            Err(_) => Err(ProtocolError::NoReply),
        }
    }

    /// Typed wrapper around [`OcppLink::call`].
    pub async fn request<P, R>(&self, action: &str, payload: &P) -> Result<R, ProtocolError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload).map_err(|e| ProtocolError::Encode {
            action: action.to_string(),
            source: e,
        })?;
        let reply = self.call(action, payload).await?;
        serde_json::from_value(reply).map_err(|e| ProtocolError::Decode {
            action: action.to_string(),
            source: e,
        })
    }

    /// Process one inbound wire frame.
    pub async fn handle_incoming<H>(&self, text: &str, handler: &H)
    where
        H: InboundDispatch + ?Sized,
    {
        let frame = match OcppFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, raw = text, "Discarding unparseable frame");
                return;
            }
        };

        match frame {
            OcppFrame::CallResult { unique_id, payload } => {
                match self.pending.remove(&unique_id) {
                    Some((_, reply)) => {
                        let _ = reply.send(Ok(payload));
                    }
                    None => warn!(unique_id = %unique_id, "CallResult matches no pending call"),
                }
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => match self.pending.remove(&unique_id) {
                Some((_, reply)) => {
                    let _ = reply.send(Err(ProtocolError::CallError {
                        code: error_code,
                        description: error_description,
                    }));
                }
                None => warn!(unique_id = %unique_id, "CallError matches no pending call"),
            },
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                debug!(action = %action, unique_id = %unique_id, "Dispatching inbound call");
                match handler.on_call(&action, &payload).await {
                    Ok(reply) => {
                        self.send_frame(OcppFrame::call_result(&unique_id, reply));
                        handler.after_call(&action, &payload).await;
                    }
                    Err(DispatchError::NotImplemented(action)) => {
                        warn!(action = %action, "Action not supported");
                        self.send_frame(OcppFrame::call_error(
                            &unique_id,
                            "NotImplemented",
                            format!("Action {action} is not supported"),
                        ));
                    }
                    Err(e @ DispatchError::Malformed { .. }) => {
                        warn!(error = %e, "Rejecting malformed call");
                        self.send_frame(OcppFrame::call_error(
                            &unique_id,
                            "FormationViolation",
                            e.to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Queue a frame for transmission; drops silently once the writer is gone.
    pub fn send_frame(&self, frame: OcppFrame) {
        let _ = self.outbound.send(Message::Text(frame.serialize()));
    }

    /// Fail every in-flight call with `NoReply`. Called when the transport
    /// goes away underneath us.
    pub fn abort_pending(&self) {
        let unique_ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for unique_id in unique_ids {
            if let Some((_, reply)) = self.pending.remove(&unique_id) {
                let _ = reply.send(Err(ProtocolError::NoReply));
            }
        }
    }

    /// Tear the link down: fail pending calls and ask the writer to close
    /// the socket.
    pub fn shutdown(&self) {
        self.abort_pending();
        let _ = self.outbound.send(Message::Close(None));
    }
}
