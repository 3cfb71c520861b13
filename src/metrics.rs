use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub const ASSIGN_TOTAL: &str = "stim_assign_total";
pub const CLAIM_CONFLICTS_TOTAL: &str = "stim_claim_conflicts_total";
pub const STORE_ERRORS_TOTAL: &str = "stim_store_errors_total";
pub const ASSIGN_MS: &str = "stim_assign_ms";
pub const SINK_WRITES_TOTAL: &str = "results_sink_writes_total";
pub const SESSION_CONNECTIONS: &str = "session_connections";

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(ASSIGN_TOTAL, "Single-stimulus assignments by provenance.");
        describe_counter!(
            CLAIM_CONFLICTS_TOTAL,
            "Conditional claims lost to a concurrent request."
        );
        describe_counter!(STORE_ERRORS_TOTAL, "Store call failures by operation.");
        describe_histogram!(ASSIGN_MS, "Single-stimulus assignment latency in milliseconds.");
        describe_counter!(SINK_WRITES_TOTAL, "Results sink writes by outcome.");
        describe_gauge!(SESSION_CONNECTIONS, "Open participant session sockets.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Call once per process.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
