// src/session.rs
//! Per-participant session channel.
//!
//! Frames are JSON envelopes `{"event": "...", "data": {...}}`. The server opens
//! with `onConnected {gameid}`; the client may then send `getStim`, `stroke`, and
//! `currentData`. Only `getStim` gets a reply (`stimulus`).

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use metrics::gauge;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::assign::{Assignment, AssignmentService, ConsumptionRequest};
use crate::metrics::SESSION_CONNECTIONS;
use crate::pool::{CollectionRef, ConsumerId};
use crate::sink::ResultsSink;
use crate::telemetry::anon_id;

pub const EVENT_CONNECTED: &str = "onConnected";
pub const EVENT_GET_STIM: &str = "getStim";
pub const EVENT_STIMULUS: &str = "stimulus";
pub const EVENT_STROKE: &str = "stroke";
pub const EVENT_CURRENT_DATA: &str = "currentData";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

/// Fresh session id: four random digits, a dash, then a v4 UUID.
pub fn new_session_id() -> String {
    let mut rng = rand::rng();
    let digits: String = (0..4)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect();
    format!("{digits}-{}", uuid::Uuid::new_v4())
}

/// State and event handling for one connection, independent of the socket.
pub struct Session {
    pub id: String,
    pool: CollectionRef,
    assign: Arc<AssignmentService>,
    sink: Arc<ResultsSink>,
    stims_sent: usize,
    records_written: usize,
}

impl Session {
    pub fn new(pool: CollectionRef, assign: Arc<AssignmentService>, sink: Arc<ResultsSink>) -> Self {
        Self {
            id: new_session_id(),
            pool,
            assign,
            sink,
            stims_sent: 0,
            records_written: 0,
        }
    }

    pub fn greeting(&self) -> Envelope {
        Envelope::new(EVENT_CONNECTED, json!({ "gameid": self.id }))
    }

    /// Handle one inbound text frame; returns the reply to send, if any.
    pub async fn handle_text(&mut self, text: &str) -> Option<Envelope> {
        let env: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(target: "session", session = %anon_id(&self.id), error = %e, "malformed frame ignored");
                return None;
            }
        };

        match env.event.as_str() {
            EVENT_GET_STIM => Some(self.get_stim(&env.data).await),
            EVENT_STROKE | EVENT_CURRENT_DATA => {
                self.forward_record(&env.event, env.data).await;
                None
            }
            other => {
                debug!(target: "session", event = other, "unknown event ignored");
                None
            }
        }
    }

    async fn get_stim(&mut self, data: &Value) -> Envelope {
        let consumer = data
            .get("gameID")
            .or_else(|| data.get("gameid"))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(self.id.as_str())
            .to_string();
        let req = ConsumptionRequest::single(self.pool.clone(), ConsumerId(consumer));

        // Participants never see store errors: anything short of a result gets a local item.
        let assignment = match self.assign.get_single_stimulus(&req).await {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(target: "session", error = %e, "error getting stims, falling back to local list");
                self.assign.fallback_assignment()
            }
        };
        self.stims_sent += 1;
        stimulus_envelope(assignment)
    }

    async fn forward_record(&mut self, event: &str, data: Value) {
        let Value::Object(record) = data else {
            warn!(target: "session", event, "record is not a JSON object, dropped");
            return;
        };
        match self.sink.append(event, record).await {
            Ok(receipt) => {
                self.records_written += 1;
                debug!(target: "session", event, collection = %receipt.target, id = %receipt.inserted_id, "sent data to store");
            }
            Err(e) => warn!(target: "session", event, error = %e, "error sending data to store"),
        }
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.stims_sent, self.records_written)
    }
}

fn stimulus_envelope(assignment: Option<Assignment>) -> Envelope {
    let data = match assignment {
        Some(a) => serde_json::to_value(&a).unwrap_or_else(|_| json!({ "stim": Value::Null })),
        None => json!({ "provenance": Value::Null, "stim": Value::Null }),
    };
    Envelope::new(EVENT_STIMULUS, data)
}

/// `GET /socket` upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(mut socket: WebSocket, state: AppState) {
    let mut session = Session::new(state.session_pool.clone(), state.assign.clone(), state.sink.clone());
    let opened = Instant::now();
    gauge!(SESSION_CONNECTIONS).increment(1.0);
    info!(target: "session", session = %anon_id(&session.id), "participant connected");

    if send(&mut socket, &session.greeting()).await.is_ok() {
        while let Some(frame) = socket.recv().await {
            let reply = match frame {
                Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => None,
                Err(e) => {
                    debug!(target: "session", error = %e, "socket receive failed");
                    break;
                }
            };
            if let Some(env) = reply {
                if send(&mut socket, &env).await.is_err() {
                    break;
                }
            }
        }
    }

    gauge!(SESSION_CONNECTIONS).decrement(1.0);
    let (stims, records) = session.stats();
    info!(
        target: "session",
        session = %anon_id(&session.id),
        stims,
        records,
        secs = opened.elapsed().as_secs(),
        "participant disconnected"
    );
}

async fn send(socket: &mut WebSocket, env: &Envelope) -> Result<(), axum::Error> {
    let text = serde_json::to_string(env).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
