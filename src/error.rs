// src/error.rs
//! Error taxonomy for the pool, the assignment service, and the results sink.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::pool::{CollectionRef, ItemId};

/// Failures surfaced by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("pool {0} is absent or empty")]
    PoolNotFound(CollectionRef),

    #[error("item {item} not found in {pool}")]
    ItemNotFound { pool: CollectionRef, item: ItemId },

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store operation failed: {0}")]
    Operation(String),
}

impl StoreError {
    /// Timeouts and dropped connections may succeed on a second try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

/// Failures of a single- or batch-stimulus request.
#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("{0}")]
    Validation(String),

    #[error("no stimulus pool at {0}")]
    PoolNotFound(CollectionRef),

    #[error("no claimable stimulus in {pool} after {attempts} attempts")]
    PoolExhausted { pool: CollectionRef, attempts: u32 },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AssignError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PoolNotFound(pool) => Self::PoolNotFound(pool),
            other => Self::Store(other),
        }
    }
}

impl AssignError {
    /// Conditions under which a single-item request degrades to fallback sampling.
    pub fn falls_back(&self) -> bool {
        match self {
            Self::PoolNotFound(_) | Self::PoolExhausted { .. } => true,
            Self::Store(e) => e.is_retryable(),
            Self::Validation(_) => false,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PoolNotFound(_) | Self::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AssignError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Clients get the category; the full store error stays in the log.
        let text = match &self {
            Self::Store(_) => "stimulus store unavailable".to_string(),
            other => other.to_string(),
        };
        tracing::error!(target: "store", error = %self, %status, "request failed");
        (status, crate::api::store_message(&text)).into_response()
    }
}

/// Failures of the results sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for SinkError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Store(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let text = match &self {
            Self::Validation(msg) => msg.clone(),
            Self::Store(e) => format!("error inserting data: {e}"),
        };
        tracing::error!(target: "sink", error = %self, %status, "insert failed");
        (status, crate::api::store_message(&text)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> CollectionRef {
        CollectionRef::new("stimuli", "photodraw2")
    }

    #[test]
    fn pool_not_found_converts_to_assign_variant() {
        let e: AssignError = StoreError::PoolNotFound(pool()).into();
        assert!(matches!(e, AssignError::PoolNotFound(_)));
        assert!(e.falls_back());
    }

    #[test]
    fn only_unavailability_falls_back() {
        assert!(AssignError::from(StoreError::Timeout(Duration::from_secs(1))).falls_back());
        assert!(AssignError::from(StoreError::Connection("refused".into())).falls_back());
        assert!(!AssignError::from(StoreError::Operation("bad doc".into())).falls_back());
        assert!(!AssignError::Validation("needs collection".into()).falls_back());
    }

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(AssignError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AssignError::PoolExhausted { pool: pool(), attempts: 3 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AssignError::from(StoreError::Operation("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
