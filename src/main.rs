//! The Kafka replication autothrottle controller.

mod admin;
mod app;
mod bandwidth;
mod config;
mod error;
mod events;
#[cfg(test)]
mod fixtures;
mod limits;
mod overrides;
mod reassignments;
#[cfg(test)]
mod reassignments_test;
mod server;
mod throttle;
mod zk;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use structopt::StructOpt;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_args());

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var, default to info.
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let prom = PrometheusBuilder::new()
        .install_recorder()
        .context("error installing prometheus metrics recorder")?;

    tracing::info!(
        interval = config.interval,
        api_listen = %config.api_listen,
        zk_addr = %config.zk_addr,
        metrics_window = config.metrics_window,
        "autothrottle running",
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let app = App::new(config, Some(prom), shutdown_tx.clone()).await?;
    if let Err(err) = app.spawn().await.context("error joining application handle").and_then(|res| res) {
        tracing::error!(error = ?err);
        let _res = shutdown_tx.send(());
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
