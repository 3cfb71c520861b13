// src/sink.rs
//! Results sink: append-only writes of trial and stroke records.
//!
//! Each record names its own target through `dbname` / `colname`; those two
//! fields are stripped and everything else is stored as one document.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::SinkError;
use crate::metrics::{ensure_metrics_described, SINK_WRITES_TOTAL};
use crate::pool::{bounded, CollectionRef, RecordStore};

pub const FIELD_DBNAME: &str = "dbname";
pub const FIELD_COLNAME: &str = "colname";

pub struct ResultsSink {
    store: Arc<dyn RecordStore>,
    call_timeout: Duration,
}

/// Outcome of one append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertReceipt {
    pub target: CollectionRef,
    pub inserted_id: String,
}

impl ResultsSink {
    pub fn new(store: Arc<dyn RecordStore>, call_timeout: Duration) -> Self {
        ensure_metrics_described();
        Self { store, call_timeout }
    }

    /// Validate the target, strip it from the record, and insert the rest.
    /// `endpoint` only labels validation messages (e.g. `/db/insert`).
    pub async fn append(&self, endpoint: &str, mut body: Map<String, Value>) -> Result<InsertReceipt, SinkError> {
        let dest = split_target(endpoint, &mut body)?;
        debug!(target: "sink", collection = %dest, fields = body.len(), "got request to insert");

        match bounded(self.call_timeout, self.store.insert(&dest, body)).await {
            Ok(inserted_id) => {
                counter!(SINK_WRITES_TOTAL, "outcome" => "ok").increment(1);
                Ok(InsertReceipt {
                    target: dest,
                    inserted_id,
                })
            }
            Err(e) => {
                counter!(SINK_WRITES_TOTAL, "outcome" => "error").increment(1);
                error!(target: "sink", collection = %dest, error = %e, "error inserting data");
                Err(e.into())
            }
        }
    }
}

/// Pull `dbname` / `colname` out of a request body. Both must be non-empty strings.
pub fn split_target(endpoint: &str, body: &mut Map<String, Value>) -> Result<CollectionRef, SinkError> {
    let col = take_name(body, FIELD_COLNAME)
        .ok_or_else(|| SinkError::Validation(format!("{endpoint} needs collection")))?;
    let db = take_name(body, FIELD_DBNAME)
        .ok_or_else(|| SinkError::Validation(format!("{endpoint} needs database")))?;
    Ok(CollectionRef::new(db, col))
}

fn take_name(body: &mut Map<String, Value>, field: &str) -> Option<String> {
    match body.remove(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}
