//! burrow agent.
//!
//! The agent runs inside the private network, dials the controller over
//! mTLS, and executes tunnelled HTTP requests against the local backend
//! with credentials discovered from a kubeconfig or the pod's service
//! account. Responses stream back as a header frame, body chunks, and a
//! terminating empty chunk.
//!
//! # Module Organization
//!
//! - [`config`]: YAML configuration for the controller address and TLS material
//! - [`credentials`]: backend credential discovery, snapshots, and refresh
//! - [`cancel`]: per-request cancellation handles, looked up by cancel frames
//! - [`executor`]: the outbound HTTP call and response streaming
//! - [`runtime`]: the tunnel connection and its cooperating tasks

pub mod cancel;
pub mod config;
pub mod credentials;
pub mod executor;
pub mod runtime;

pub use cancel::CancelRegistry;
pub use config::AgentConfig;
pub use credentials::{BackendCredentials, CredentialError, CredentialStore};
