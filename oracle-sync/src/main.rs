// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use oracle_sync::config::OracleSyncConfig;
use oracle_sync::metrics::run_metrics_server;
use oracle_sync::node::run_sync_node;
use oracle_sync_config::Config;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
    /// Write a template config to `config-path` and exit.
    #[clap(long)]
    pub print_config_template: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if args.print_config_template {
        OracleSyncConfig::template().save(&args.config_path)?;
        info!("Config template written to {:?}", args.config_path);
        return Ok(());
    }

    let config = OracleSyncConfig::load(&args.config_path)?.validate()?;

    let prometheus_registry = prometheus::Registry::new();
    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let _metrics_handle = run_metrics_server(metrics_address, prometheus_registry.clone());
    info!("Metrics server started at port {}", config.metrics_port);

    let cancel = CancellationToken::new();
    let handles = run_sync_node(config, &prometheus_registry, cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();
    for handle in handles {
        handle
            .await
            .map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
    }
    Ok(())
}
