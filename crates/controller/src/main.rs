//! burrow controller - main entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use burrow_common::{init_tracing, RequestIdMinter};
use burrow_controller::http::ApiContext;
use burrow_controller::{config::ControllerConfig, http, metrics, registry::AgentRegistry, server, tls};

/// burrow controller - exposes HTTP endpoints served by remote agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "BURROW_CONTROLLER_CONFIG",
        default_value = "/app/config/config.yaml"
    )]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .ok();

    let config = ControllerConfig::load(&cli.config).context("Error loading config")?;
    config.log_summary();

    let tls_config = tls::build_server_config(
        &config.cert_file,
        &config.key_file,
        &config.ca_cert_file,
    )
    .context("Failed to build TLS configuration")?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let registry = Arc::new(AgentRegistry::new());
    let api_ctx = Arc::new(ApiContext {
        registry: Arc::clone(&registry),
        minter: RequestIdMinter::new(),
    });

    // Every listener must bind before any traffic is served.
    let tunnel_listener = TcpListener::bind((config.bind_address.as_str(), config.tunnel_port))
        .await
        .with_context(|| format!("Failed to bind tunnel port {}", config.tunnel_port))?;
    let api_listener = TcpListener::bind((config.bind_address.as_str(), config.api_port))
        .await
        .with_context(|| format!("Failed to bind API port {}", config.api_port))?;
    let metrics_listener = TcpListener::bind((config.bind_address.as_str(), config.prometheus_port))
        .await
        .with_context(|| format!("Failed to bind Prometheus port {}", config.prometheus_port))?;

    info!("Controller started");

    let servers = async {
        tokio::try_join!(
            metrics::run_metrics_server(metrics_listener),
            http::run_api_server(api_listener, acceptor.clone(), api_ctx),
            server::run_tunnel_server(tunnel_listener, acceptor, Arc::clone(&registry)),
        )
    };

    tokio::select! {
        result = servers => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, draining in-flight requests");
            registry.drain_all();
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
            while registry.outstanding_total() > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        }
    }

    Ok(())
}
