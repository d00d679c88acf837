//! TLS setup for the controller's listeners.
//!
//! Both the tunnel port and the client-facing HTTPS port require peer
//! certificates signed by the configured CA; there is no fallback to
//! hostname-only authentication. The agent identity is the first
//! dot-separated label of the verified peer certificate's common name.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tracing::info;

use burrow_common::AgentIdentity;

/// Error type for TLS operations.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to load certificate: {0}")]
    CertificateLoad(String),

    #[error("Failed to load private key: {0}")]
    KeyLoad(String),

    #[error("Failed to build TLS config: {0}")]
    ConfigBuild(String),

    #[error("Peer presented no verified certificate")]
    NoClientCertificate,

    #[error("Invalid peer certificate: {0}")]
    InvalidCertificate(String),
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad(format!(
            "{}: No certificates found in file",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file =
        File::open(path).map_err(|e| TlsError::KeyLoad(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::KeyLoad(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| TlsError::KeyLoad(format!("{}: No private key found in file", path.display())))
}

/// Load CA certificates for client verification.
pub fn load_client_ca(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .map_err(|e| TlsError::InvalidCertificate(format!("Failed to add CA certificate: {}", e)))?;
    }
    if root_store.is_empty() {
        return Err(TlsError::CertificateLoad(format!(
            "{}: No CA certificates found",
            path.display()
        )));
    }
    info!(
        ca_file = %path.display(),
        cert_count = root_store.len(),
        "Loaded client CA certificates"
    );
    Ok(root_store)
}

/// Build the server config shared by the tunnel and API listeners:
/// CA-verified client certificates required, TLS 1.2 minimum (the
/// default protocol set).
pub fn build_server_config(
    cert_file: &Path,
    key_file: &Path,
    ca_file: &Path,
) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    let roots = load_client_ca(ca_file)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::ConfigBuild(format!("Failed to build client verifier: {}", e)))?;

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::ConfigBuild(e.to_string()))
}

/// Extract the agent identity from the verified peer certificate chain:
/// the first dot-separated label of the leaf's subject common name.
pub fn peer_identity(certs: &[CertificateDer<'_>]) -> Result<AgentIdentity, TlsError> {
    let leaf = certs.first().ok_or(TlsError::NoClientCertificate)?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| {
            TlsError::InvalidCertificate("certificate subject has no common name".to_string())
        })?;

    Ok(AgentIdentity::from_common_name(common_name))
}
