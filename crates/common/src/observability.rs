//! Observability for the burrow tunnel.
//!
//! Provides tracing initialisation for the binaries and the two core
//! metric families the controller exposes: a per-identity request counter
//! and a per-identity connected-agents gauge.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing/logging subsystem.
///
/// `RUST_LOG` takes precedence; otherwise the level falls back to `debug`
/// when `verbose` is set and `info` otherwise.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

/// The tunnel's core metric families, registered against the default
/// Prometheus registry.
pub struct CoreMetrics {
    /// Inbound HTTP requests, counted once per request before routing.
    pub api_requests: IntCounterVec,
    /// Currently live agent sessions per identity.
    pub agents_connected: IntGaugeVec,
}

impl CoreMetrics {
    fn new() -> Self {
        let api_requests = register_int_counter_vec!(
            "controller_api_requests_total",
            "The total number of API requests",
            &["agent_identity"]
        )
        .expect("register controller_api_requests_total");

        let agents_connected = register_int_gauge_vec!(
            "agents_connected",
            "The currently connected agents",
            &["agent_identity"]
        )
        .expect("register agents_connected");

        Self {
            api_requests,
            agents_connected,
        }
    }
}

/// Process-wide metric handles.
pub fn core_metrics() -> &'static CoreMetrics {
    static METRICS: Lazy<CoreMetrics> = Lazy::new(CoreMetrics::new);
    &METRICS
}

/// Render the default registry in Prometheus text format.
pub fn render_metrics() -> String {
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
