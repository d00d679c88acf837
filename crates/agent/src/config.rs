//! Agent configuration.
//!
//! Names the controller endpoint, the agent's own TLS material, and where
//! backend credentials come from. The CA certificate may be given as a
//! file path or inline as base64 for deployments that cannot mount it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use burrow_tunnel_protocol::defaults::{DEFAULT_TUNNEL_PORT, KEEPALIVE_PERIOD};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct AgentConfig {
    /// `host:port` of the controller's tunnel listener.
    pub controller_hostname: String,
    /// Certificate the agent presents to the controller.
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// CA used to verify the controller's certificate.
    pub ca_cert_file: PathBuf,
    /// Inline base64 PEM fallback when no CA file exists on disk.
    pub ca_cert_base64: Option<String>,
    /// Kubeconfig with the backend endpoint and auth; when absent the
    /// in-pod service account is used instead.
    pub kubeconfig: PathBuf,
    /// Namespaces advertised in the hello frame.
    pub namespaces: Vec<String>,
    /// Seconds between keepalive pings.
    pub tick_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            controller_hostname: format!("localhost:{}", DEFAULT_TUNNEL_PORT),
            cert_file: PathBuf::from("/app/secrets/agent/tls.crt"),
            key_file: PathBuf::from("/app/secrets/agent/tls.key"),
            ca_cert_file: PathBuf::from("/app/config/ca.pem"),
            ca_cert_base64: None,
            kubeconfig: PathBuf::from("/app/config/kubeconfig.yaml"),
            namespaces: Vec::new(),
            tick_seconds: KEEPALIVE_PERIOD.as_secs(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!(
            controller = %self.controller_hostname,
            cert_file = %self.cert_file.display(),
            kubeconfig = %self.kubeconfig.display(),
            namespaces = ?self.namespaces,
            tick_seconds = self.tick_seconds,
            "Agent configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.controller_hostname, "localhost:9001");
        assert_eq!(config.tick_seconds, 30);
        assert!(config.namespaces.is_empty());
    }

    #[test]
    fn test_load_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "controller-hostname: controller.example:9001\nnamespaces:\n  - default\n  - kube-system\ntick-seconds: 5\n"
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.controller_hostname, "controller.example:9001");
        assert_eq!(config.namespaces, vec!["default", "kube-system"]);
        assert_eq!(config.tick_seconds, 5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AgentConfig::load(Path::new("/nonexistent/config.yaml")).is_err());
    }
}
