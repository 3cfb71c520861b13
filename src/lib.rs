// src/lib.rs
// Public library surface for the server binary, the pool simulator, and integration tests.

pub mod api;
pub mod assign;
pub mod config;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod sink;
pub mod telemetry;

// `crate_root::api::router` and `crate_root::router` both build the HTTP surface.
pub use crate::api::{router, AppState};

use std::sync::Arc;

use axum::Router;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::assign::AssignmentService;
use crate::config::ServerConfig;
use crate::fallback::FallbackSampler;
use crate::pool::{RecordStore, StimulusStore};
use crate::sink::ResultsSink;

/// Wire the assignment service and results sink over one store.
pub fn build_state<S>(cfg: &ServerConfig, store: Arc<S>, fallback: FallbackSampler) -> AppState
where
    S: StimulusStore + RecordStore + 'static,
{
    let call_timeout = cfg.assign.call_timeout();
    AppState {
        assign: Arc::new(AssignmentService::new(store.clone(), fallback, cfg.assign.clone())),
        sink: Arc::new(ResultsSink::new(store, call_timeout)),
        session_pool: cfg.session.pool(),
    }
}

/// Fallback list named by the config. A missing or unreadable file leaves the list empty.
pub fn load_fallback(cfg: &ServerConfig) -> FallbackSampler {
    let Some(path) = cfg.assign.fallback_path.as_deref() else {
        warn!("no fallback stimulus list configured; pool outages will surface as errors");
        return FallbackSampler::default();
    };
    match FallbackSampler::load_from_file(path) {
        Ok(sampler) => {
            info!(path = %path.display(), candidates = sampler.len(), "fallback stimulus list loaded");
            sampler
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "fallback stimulus list unavailable");
            FallbackSampler::default()
        }
    }
}

/// Full HTTP app: API routes, optional `/metrics`, and static experiment files for everything else.
pub fn app(cfg: &ServerConfig, state: AppState, metrics: Option<&crate::metrics::Metrics>) -> Router {
    let mut app = router(state);
    if let Some(m) = metrics {
        app = app.merge(m.router());
    }
    match cfg.server.static_dir.as_ref() {
        Some(dir) if dir.is_dir() => app.fallback_service(ServeDir::new(dir)),
        Some(dir) => {
            warn!(dir = %dir.display(), "static directory not found, serving API only");
            app
        }
        None => app,
    }
}
