#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `fieldbridge`: loads a YAML configuration, brings up the unified
//! bridge (protocol clients, backpressure queue, batcher, sink) for every
//! enabled source, and serves the read-only management HTTP surface until
//! a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use bridge::Bridge;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the connector binary.
#[derive(Debug, Parser)]
#[command(name = "fieldbridge", about = "OT-to-cloud telemetry DMZ connector")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "fieldbridge.yaml")]
    config: String,
}

/// Grace period the bridge waits for in-flight batches to drain before
/// abandoning background tasks on shutdown.
const SOFT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let cfg = config::Config::load(&args.config).wrap_err_with(|| format!("loading configuration from `{}`", args.config))?;

    init_tracing(&cfg.connector.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().wrap_err("building the tokio runtime")?;

    runtime.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> Result<()> {
    tracing::info!(connector = %cfg.connector.name, sources = cfg.sources.len(), "starting fieldbridge");

    let bind_address = cfg.connector.management_bind_address.clone();
    let bridge = Arc::new(Bridge::from_config(&cfg).await.wrap_err("bringing up the bridge from configuration")?);

    let shutdown_signal = {
        let bridge = bridge.clone();
        async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received, draining sources");
            bridge.shutdown(SOFT_SHUTDOWN_TIMEOUT).await;
        }
    };

    bridge::http::serve(bridge, &bind_address, shutdown_signal).await.wrap_err("management HTTP server")?;

    tracing::info!("fieldbridge stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
