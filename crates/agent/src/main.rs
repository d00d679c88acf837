//! burrow agent - main entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use burrow_agent::{config::AgentConfig, credentials::CredentialStore, runtime};
use burrow_common::init_tracing;

/// burrow agent - executes tunnelled HTTP requests inside the private network
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "BURROW_AGENT_CONFIG",
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

    let config = AgentConfig::load(&cli.config).context("Error loading config")?;
    config.log_summary();

    let credentials = Arc::new(
        CredentialStore::new(&config.kubeconfig)
            .context("No kubeconfig and no Kubernetes account found")?,
    );
    tokio::spawn(Arc::clone(&credentials).run_refresher());

    info!("Starting tunnel");
    runtime::run_tunnel(&config, credentials).await?;
    info!("Done");
    Ok(())
}
