//! Common utilities shared by the burrow controller and agent.
//!
//! This crate provides the pieces both processes need: type-safe
//! identifiers, tracing initialisation, the core Prometheus metrics, and
//! wall-clock helpers.
//!
//! # Module Organization
//!
//! - [`ids`]: Type-safe identifier newtypes (AgentIdentity, RequestId, SessionId)
//! - [`observability`]: Tracing setup and the tunnel's core metrics

pub mod ids;
pub mod observability;

// Re-export commonly used items at the crate root
pub use ids::{AgentIdentity, RequestId, RequestIdMinter, SessionId};
pub use observability::{core_metrics, init_tracing, render_metrics, CoreMetrics};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
