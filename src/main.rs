// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The pvelb binary: configuration loading, logging setup, and the
//! supervisor-facing process contract (exit 0 never happens in normal
//! operation; any fatal condition exits non-zero and leaves the restart to
//! the supervisor).

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use pvelb_config::Config;
use pvelb_engine::{Balancer, EngineContext, LogNotifier};
use pvelb_proxmox::ProxmoxClient;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Automated live-migration load balancer for Proxmox VE clusters.
#[derive(Debug, Parser)]
#[command(name = "pvelb", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn init_tracing(logging_level: &str) {
    // RUST_LOG wins over the configured level when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging_level.to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_yaml_file(&cli.config)?;
    init_tracing(&config.logging_level);

    if cli.check {
        info!(config = %cli.config.display(), "configuration is valid");
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting the cluster load balancer"
    );

    let ctx = EngineContext::new(config)?;
    let client = ProxmoxClient::new(&ctx.config.proxmox).into_diagnostic()?;
    client.login().await.into_diagnostic()?;

    let mut balancer = Balancer::new(client, LogNotifier::new(), ctx);
    balancer.run().await.into_diagnostic()?;
    Ok(())
}
