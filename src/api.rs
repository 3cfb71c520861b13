use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::assign::{AssignmentService, ConsumptionRequest};
use crate::error::AssignError;
use crate::pool::{CollectionRef, ConsumerId};
use crate::session;
use crate::sink::{split_target, ResultsSink};

pub const PROVENANCE_HEADER: &str = "x-stim-provenance";

#[derive(Clone)]
pub struct AppState {
    pub assign: Arc<AssignmentService>,
    pub sink: Arc<ResultsSink>,
    /// Pool the websocket session draws from.
    pub session_pool: CollectionRef,
}

/// Every store-facing text reply carries the same prefix.
pub fn store_message(text: &str) -> String {
    format!("[store] {text}")
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/db/insert", post(insert))
        .route("/db/getsinglestim", post(get_single_stim))
        .route("/db/getbatchstims", post(get_batch_stims))
        .route("/socket", get(session::ws_handler))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub use create_router as router;

fn bad_request(msg: String) -> Response {
    tracing::warn!(target: "api", %msg, "rejected request");
    (StatusCode::BAD_REQUEST, store_message(&msg)).into_response()
}

/// Parse a POST body into a JSON object, with the `[store]` wording for each failure.
fn object_body(endpoint: &str, body: &Bytes) -> Result<Map<String, Value>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(bad_request(format!("{endpoint} needs post request body")));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(bad_request(format!("{endpoint} needs a JSON object body"))),
        Err(e) => Err(bad_request(format!("{endpoint} body is not valid JSON: {e}"))),
    }
}

fn target(endpoint: &str, body: &mut Map<String, Value>) -> Result<CollectionRef, Response> {
    split_target(endpoint, body).map_err(|e| bad_request(e.to_string()))
}

fn non_empty_str<'a>(body: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

async fn insert(State(state): State<AppState>, body: Bytes) -> Result<Response, Response> {
    const ENDPOINT: &str = "/db/insert";
    let record = object_body(ENDPOINT, &body)?;
    let receipt = state
        .sink
        .append(ENDPOINT, record)
        .await
        .map_err(IntoResponse::into_response)?;

    let result = json!({ "acknowledged": true, "insertedId": receipt.inserted_id });
    Ok(store_message(&format!("successfully inserted data. result: {result}")).into_response())
}

async fn get_single_stim(State(state): State<AppState>, body: Bytes) -> Result<Response, Response> {
    const ENDPOINT: &str = "/db/getsinglestim";
    let mut body = object_body(ENDPOINT, &body)?;
    let pool = target(ENDPOINT, &mut body)?;
    let Some(gameid) = non_empty_str(&body, "gameid") else {
        return Err(bad_request(format!("{ENDPOINT} needs gameid")));
    };

    let mut req = ConsumptionRequest::single(pool, ConsumerId(gameid.to_string()));
    if let Some(key) = non_empty_str(&body, "requestId") {
        req = req.with_request_key(key);
    }

    let assignment = state
        .assign
        .get_single_stimulus(&req)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok((
        [(PROVENANCE_HEADER, assignment.provenance.as_str())],
        Json(assignment.item),
    )
        .into_response())
}

async fn get_batch_stims(State(state): State<AppState>, body: Bytes) -> Result<Response, Response> {
    const ENDPOINT: &str = "/db/getbatchstims";
    let mut body = object_body(ENDPOINT, &body)?;
    let pool = target(ENDPOINT, &mut body)?;
    let limit = max_records(ENDPOINT, &body)?;

    let items = state
        .assign
        .get_batch_stimuli(&pool, limit)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(items).into_response())
}

/// `maxRecords` may arrive as a number or a numeric string.
fn max_records(endpoint: &str, body: &Map<String, Value>) -> Result<Option<usize>, Response> {
    let parsed = match body.get("maxRecords") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(n) if n > 0 => Ok(Some(usize::try_from(n).unwrap_or(usize::MAX))),
        _ => Err(AssignError::Validation(format!(
            "{endpoint} needs maxRecords to be a positive integer"
        ))
        .into_response()),
    }
}
