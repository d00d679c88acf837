//! The agent's tunnel connection.
//!
//! Dials the controller with mTLS, sends the hello, then runs the
//! cooperating tasks: a pinger on the keepalive tick, an outbound
//! forwarder draining the shared dataflow channel into the stream, and
//! the receive loop dispatching requests and cancels. The credential
//! refresher runs independently (see
//! [`CredentialStore::run_refresher`](crate::credentials::CredentialStore::run_refresher)).

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use burrow_common::now_millis;
use burrow_tunnel_protocol::defaults::{
    CHANNEL_BOUND, DIAL_TIMEOUT, PROTOCOL_KUBERNETES, PROTOCOL_VERSION,
};
use burrow_tunnel_protocol::{
    read_frame, write_frame, AgentHello, AgentToController, ControllerToAgent, PingRequest,
};

use crate::cancel::CancelRegistry;
use crate::config::AgentConfig;
use crate::credentials::CredentialStore;
use crate::executor;

/// Load the CA bundle used to verify the controller: the configured file,
/// or the inline base64 fallback from the config.
fn load_controller_ca(config: &AgentConfig) -> Result<Vec<u8>> {
    match std::fs::read(&config.ca_cert_file) {
        Ok(pem) => Ok(pem),
        Err(_) => match config.ca_cert_base64.as_deref() {
            Some(encoded) => BASE64
                .decode(encoded)
                .context("Unable to decode CA cert base64 from config"),
            None => bail!("Unable to load CA certificate from file or from config"),
        },
    }
}

/// Client TLS for the controller connection: CA-pinned roots plus the
/// agent's own keypair, minimum TLS 1.2.
fn build_tls_config(config: &AgentConfig) -> Result<ClientConfig> {
    let ca_pem = load_controller_ca(config)?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(&ca_pem[..])) {
        let cert = cert.context("Failed to parse CA certificate")?;
        roots
            .add(cert)
            .context("Unable to append certificate to pool")?;
    }

    let cert_file = File::open(&config.cert_file).with_context(|| {
        format!(
            "Unable to load agent certificate: {}",
            config.cert_file.display()
        )
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse agent certificate")?;

    let key_file = File::open(&config.key_file).with_context(|| {
        format!("Unable to load agent key: {}", config.key_file.display())
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("Failed to parse agent key")?
        .context("No private key found in agent key file")?;

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("Failed to build TLS configuration")
}

/// Dial the controller, handshake, and serve the stream until it ends.
pub async fn run_tunnel(config: &AgentConfig, credentials: Arc<CredentialStore>) -> Result<()> {
    let tls_config = build_tls_config(config)?;

    let (host, _port) = config
        .controller_hostname
        .rsplit_once(':')
        .with_context(|| {
            format!(
                "Controller hostname must be host:port, got {}",
                config.controller_hostname
            )
        })?;

    let tcp = timeout(
        DIAL_TIMEOUT,
        TcpStream::connect(config.controller_hostname.as_str()),
    )
        .await
        .context("Timed out dialing controller")?
        .with_context(|| format!("Could not connect to {}", config.controller_hostname))?;

    let server_name = ServerName::try_from(host.to_string())
        .with_context(|| format!("Invalid controller hostname: {}", host))?;
    let stream = TlsConnector::from(Arc::new(tls_config))
        .connect(server_name, tcp)
        .await
        .context("TLS handshake with controller failed")?;

    info!(controller = %config.controller_hostname, "Connected to controller");
    let (mut reader, mut writer) = tokio::io::split(stream);

    let hello = AgentToController::Hello(AgentHello {
        protocols: vec![PROTOCOL_KUBERNETES.to_string()],
        kubernetes_namespaces: config.namespaces.clone(),
        protocol_version: PROTOCOL_VERSION,
    });
    write_frame(&mut writer, &hello)
        .await
        .context("Unable to send hello frame")?;

    let (dataflow_tx, mut dataflow_rx) = mpsc::channel::<AgentToController>(CHANNEL_BOUND);
    let shutdown = CancellationToken::new();
    let cancels = Arc::new(CancelRegistry::new());

    // Periodic pings on the keepalive tick.
    let pinger = {
        let dataflow = dataflow_tx.clone();
        let shutdown = shutdown.clone();
        let tick = std::time::Duration::from_secs(config.tick_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let ping = AgentToController::Ping(PingRequest { ts: now_millis() });
                        if dataflow.send(ping).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    };

    // Single sender task: drains the dataflow channel into the stream.
    // Write errors are logged but non-fatal; terminal stream failure is
    // detected by the receive loop.
    let forwarder = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = dataflow_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = write_frame(&mut writer, &frame).await {
                                warn!(error = %e, "Unable to send frame to controller");
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = writer.shutdown().await;
        })
    };

    // Receive loop: dispatch until the controller closes the stream.
    loop {
        match read_frame::<_, ControllerToAgent>(&mut reader).await {
            Ok(Some(ControllerToAgent::Pong(_))) => continue,
            Ok(Some(ControllerToAgent::Cancel(cancel))) => {
                cancels.cancel(&cancel.id);
            }
            Ok(Some(ControllerToAgent::HttpRequest(request))) => {
                if request.protocol == PROTOCOL_KUBERNETES {
                    tokio::spawn(executor::execute_request(
                        dataflow_tx.clone(),
                        credentials.snapshot(),
                        Arc::clone(&cancels),
                        request,
                    ));
                } else {
                    warn!(
                        protocol = %request.protocol,
                        request_id = %request.id,
                        "Request for unsupported HTTP tunnel protocol"
                    );
                    executor::send_bad_gateway(&dataflow_tx, &request.id, &request.target).await;
                }
            }
            Ok(Some(other)) => {
                debug!(frame_type = ?other.frame_type(), "Ignoring unexpected frame");
            }
            Ok(None) => {
                info!("Controller closed the stream");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to receive frame from controller");
                break;
            }
        }
    }

    // Shut down the dataflow and let outstanding executors drain; their
    // sends fail harmlessly once the channel closes.
    shutdown.cancel();
    drop(dataflow_tx);
    let _ = tokio::join!(pinger, forwarder);
    Ok(())
}
