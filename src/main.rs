//! lbpool - backend pool and traffic-distribution engine
//!
//! Usage:
//!     lbpool --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{error, info};

use lbpool::config::{Config, ConfigWatcher, Protocol, load_config};
use lbpool::frontend::{DatagramFrontend, FrontendListener};
use lbpool::metrics::MetricsServer;
use lbpool::state::AppState;
use lbpool::util::{init_logging, wait_for_os_signal};

/// Backend pool load balancer with active health checking.
#[derive(Parser, Debug)]
#[command(name = "lbpool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    if cli.validate {
        println!("Configuration is valid.");
        println!("  Clusters: {}", config.clusters.len());
        for cluster in &config.clusters {
            println!(
                "    - {} ({:?}, {} nodes)",
                cluster.name,
                cluster.algorithm,
                cluster.nodes.len()
            );
        }
        println!("  Frontends: {}", config.frontends.len());
        for frontend in &config.frontends {
            println!(
                "    - {} ({:?} {}) -> {}",
                frontend.name, frontend.protocol, frontend.listen, frontend.cluster
            );
        }
        return Ok(());
    }

    // CLI overrides config
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.global.log_level.clone());
    init_logging(&log_level, &config.global.log_format).context("failed to initialise logging")?;

    info!(
        config_path = %cli.config.display(),
        clusters = config.clusters.len(),
        frontends = config.frontends.len(),
        "lbpool starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(cli.config, config))
}

async fn run(config_path: PathBuf, config: Config) -> Result<()> {
    let state = AppState::new(config.clone()).context("failed to build cluster registry")?;
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    for frontend in config.frontends {
        let name = frontend.name.clone();
        let listen = frontend.listen;
        let registry = state.registry().clone();
        let metrics = state.metrics().clone();
        let shutdown = state.shutdown().subscribe();

        let handle = match frontend.protocol {
            Protocol::Tcp => {
                let listener = FrontendListener::bind(frontend, registry, metrics)
                    .await
                    .with_context(|| format!("failed to bind frontend '{name}' on tcp {listen}"))?;
                tokio::spawn(listener.run(shutdown))
            }
            Protocol::Udp => {
                let listener = DatagramFrontend::bind(frontend, registry, metrics)
                    .await
                    .with_context(|| format!("failed to bind frontend '{name}' on udp {listen}"))?;
                tokio::spawn(listener.run(shutdown))
            }
        };
        handles.push(handle);
    }

    let metrics_config = &config.global.metrics;
    if metrics_config.enabled {
        let server = MetricsServer::bind(
            metrics_config.address,
            metrics_config.path.clone(),
            state.metrics().clone(),
            state.registry().clone(),
        )
        .await
        .with_context(|| format!("failed to bind metrics server on {}", metrics_config.address))?;
        handles.push(tokio::spawn(server.run(state.shutdown().subscribe())));
    }

    let reload_state = state.clone();
    let watcher = ConfigWatcher::new(
        config_path,
        Box::new(move |new_config| {
            if let Err(e) = reload_state.reload(new_config) {
                error!(error = %e, "failed to apply reloaded configuration");
            }
        }),
    );
    handles.push(tokio::spawn(watcher.run(state.shutdown().subscribe())));

    info!("lbpool is running");

    wait_for_os_signal().await;
    info!("shutting down");

    state.stop().await;
    futures::future::join_all(handles).await;

    info!("lbpool shut down complete");
    Ok(())
}
