//! Controller configuration.
//!
//! A small YAML file naming the listen ports and the TLS material. A
//! missing or unreadable file aborts startup before any listener opens.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use burrow_tunnel_protocol::defaults::{
    DEFAULT_API_PORT, DEFAULT_PROMETHEUS_PORT, DEFAULT_TUNNEL_PORT,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ControllerConfig {
    /// Address the listeners bind to.
    pub bind_address: String,
    /// Port agents dial for the tunnel stream.
    pub tunnel_port: u16,
    /// Port external clients send HTTPS requests to.
    pub api_port: u16,
    /// Port the Prometheus text endpoint listens on.
    pub prometheus_port: u16,
    /// Server certificate presented on both TLS ports.
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// CA that signed the agent and client certificates.
    pub ca_cert_file: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            tunnel_port: DEFAULT_TUNNEL_PORT,
            api_port: DEFAULT_API_PORT,
            prometheus_port: DEFAULT_PROMETHEUS_PORT,
            cert_file: PathBuf::from("/app/secrets/controller/tls.crt"),
            key_file: PathBuf::from("/app/secrets/controller/tls.key"),
            ca_cert_file: PathBuf::from("/app/config/ca.pem"),
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!(
            bind_address = %self.bind_address,
            tunnel_port = self.tunnel_port,
            api_port = self.api_port,
            prometheus_port = self.prometheus_port,
            cert_file = %self.cert_file.display(),
            ca_cert_file = %self.ca_cert_file.display(),
            "Controller configuration"
        );
    }
}
