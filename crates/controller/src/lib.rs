//! burrow controller.
//!
//! The controller accepts long-lived mutually authenticated streams from
//! agents, terminates client-facing HTTPS, and multiplexes each inbound
//! request over the stream of an agent that advertises the requested
//! identity. Responses come back as a header frame followed by chunk
//! frames and are relayed to the client as they arrive.
//!
//! # Module Organization
//!
//! - [`config`]: YAML configuration for ports and TLS material
//! - [`tls`]: server-side mTLS setup and peer identity extraction
//! - [`session`]: one state machine per connected agent stream
//! - [`registry`]: identity -> live sessions map with random pick
//! - [`server`]: the tunnel listener (agent streams + operator statistics)
//! - [`http`]: the client-facing reverse-proxy handler
//! - [`metrics`]: Prometheus text endpoint

pub mod config;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;

pub use config::ControllerConfig;
pub use registry::AgentRegistry;
pub use session::{AgentSession, EnqueueError, ResponseEvent, SessionState};
