//! In-process mock CSMS for integration tests.
//!
//! Listens on a loopback port, accepts one station connection at a time,
//! answers charge-point calls with scripted replies and records everything
//! it sees so tests can assert on the wire dialogue.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use fake_charging_station::ocpp::OcppFrame;

const WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How the mock answers an Authorize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeBehavior {
    Accept,
    Invalid,
    /// Close the connection instead of answering, so the station sees an
    /// absent reply.
    Drop,
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub boot_status: &'static str,
    pub heartbeat_interval: u32,
    pub authorize: AuthorizeBehavior,
    pub first_transaction_id: i32,
    /// ChangeConfiguration calls pushed right after the boot reply.
    pub configure_after_boot: Vec<(&'static str, &'static str)>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            boot_status: "Accepted",
            heartbeat_interval: 300,
            authorize: AuthorizeBehavior::Accept,
            first_transaction_id: 7,
            configure_after_boot: Vec::new(),
        }
    }
}

/// A reply the station sent for one of our calls.
#[derive(Debug, Clone)]
pub enum StationReply {
    Result(Value),
    Error { code: String },
}

struct Shared {
    behavior: Behavior,
    calls: Mutex<Vec<(String, Value)>>,
    replies: Mutex<Vec<StationReply>>,
    next_transaction_id: Mutex<i32>,
    conn: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    closed: Mutex<bool>,
}

pub struct MockCsms {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockCsms {
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            next_transaction_id: Mutex::new(behavior.first_transaction_id),
            behavior,
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            conn: Mutex::new(None),
            closed: Mutex::new(false),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, accept_shared.clone()));
            }
        });

        Self { addr, shared }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Payloads of every recorded call with the given action, in order.
    pub fn calls(&self, action: &str) -> Vec<Value> {
        self.shared
            .calls
            .lock()
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// The `status` field of every StatusNotification, in order.
    pub fn status_sequence(&self) -> Vec<String> {
        self.calls("StatusNotification")
            .iter()
            .map(|p| p["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn replies(&self) -> Vec<StationReply> {
        self.shared.replies.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.lock()
    }

    /// Send a CSMS-initiated call to the connected station.
    pub fn send_call(&self, action: &str, payload: Value) {
        let frame = OcppFrame::call(Uuid::new_v4().to_string(), action, payload);
        let conn = self.shared.conn.lock();
        conn.as_ref()
            .expect("no station connected")
            .send(Message::Text(frame.serialize()))
            .expect("station connection gone");
    }

    pub async fn wait_for_calls(&self, action: &str, count: usize) {
        let seen = wait_until(|| self.calls(action).len() >= count).await;
        if !seen {
            panic!(
                "timed out waiting for {count} {action} call(s), saw {:?}",
                self.shared.calls.lock()
            );
        }
    }

    pub async fn wait_for_replies(&self, count: usize) {
        let seen = wait_until(|| self.shared.replies.lock().len() >= count).await;
        if !seen {
            panic!("timed out waiting for {count} station replies");
        }
    }

    pub async fn wait_closed(&self) {
        let seen = wait_until(|| self.is_closed()).await;
        if !seen {
            panic!("timed out waiting for the station to close the socket");
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition()
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) {
    let callback = |req: &Request, mut response: Response| {
        if let Some(protocol) = req.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", protocol.clone());
        }
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sink, mut reader) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *shared.conn.lock() = Some(tx.clone());
    *shared.closed.lock() = false;

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&text, &shared, &tx),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    *shared.closed.lock() = true;
    writer.abort();
}

fn handle_frame(text: &str, shared: &Arc<Shared>, tx: &mpsc::UnboundedSender<Message>) {
    let frame = match OcppFrame::parse(text) {
        Ok(frame) => frame,
        Err(_) => return,
    };

    match frame {
        OcppFrame::Call {
            unique_id,
            action,
            payload,
        } => {
            // Record before replying, so a test that saw the reply is
            // guaranteed to also see the call.
            shared.calls.lock().push((action.clone(), payload));

            match scripted_reply(&action, shared) {
                Some(reply) => {
                    let result = OcppFrame::call_result(&unique_id, reply);
                    let _ = tx.send(Message::Text(result.serialize()));
                }
                // Scripted silence: hang up instead of answering.
                None => {
                    let _ = tx.send(Message::Close(None));
                }
            }

            if action == "BootNotification" {
                for (key, value) in &shared.behavior.configure_after_boot {
                    let call = OcppFrame::call(
                        Uuid::new_v4().to_string(),
                        "ChangeConfiguration",
                        json!({"key": key, "value": value}),
                    );
                    let _ = tx.send(Message::Text(call.serialize()));
                }
            }
        }
        OcppFrame::CallResult { payload, .. } => {
            shared.replies.lock().push(StationReply::Result(payload));
        }
        OcppFrame::CallError { error_code, .. } => {
            shared
                .replies
                .lock()
                .push(StationReply::Error { code: error_code });
        }
    }
}

fn scripted_reply(action: &str, shared: &Arc<Shared>) -> Option<Value> {
    let behavior = &shared.behavior;
    let reply = match action {
        "BootNotification" => json!({
            "status": behavior.boot_status,
            "currentTime": "2024-01-01T00:00:00Z",
            "interval": behavior.heartbeat_interval,
        }),
        "Heartbeat" => json!({"currentTime": "2024-01-01T00:00:00Z"}),
        "Authorize" => match behavior.authorize {
            AuthorizeBehavior::Accept => json!({"idTagInfo": {"status": "Accepted"}}),
            AuthorizeBehavior::Invalid => json!({"idTagInfo": {"status": "Invalid"}}),
            AuthorizeBehavior::Drop => return None,
        },
        "StartTransaction" => {
            let mut next = shared.next_transaction_id.lock();
            let transaction_id = *next;
            *next += 1;
            json!({
                "transactionId": transaction_id,
                "idTagInfo": {"status": "Accepted"},
            })
        }
        "StopTransaction" => json!({"idTagInfo": {"status": "Accepted"}}),
        _ => json!({}),
    };
    Some(reply)
}
