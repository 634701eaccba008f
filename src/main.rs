use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use pan_node::{config, Node};

#[derive(Parser, Debug)]
#[command(name = "pan-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (overrides PAN_CONFIG).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between telemetry snapshots.
    #[arg(short, long, default_value = "300")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load()?,
    };
    if args.config.is_some() {
        config::apply_env_overrides(&mut cfg);
    }

    let node = Node::start(cfg).await?;
    info!("Node identity: {}", node.node_id());

    let mut interval = time::interval(Duration::from_secs(args.stats_interval));
    interval.tick().await;

    // Graceful shutdown on SIGTERM or Ctrl+C.
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = node.stats();
                info!(
                    agents = stats.agents,
                    peers = stats.peers,
                    groups = stats.groups,
                    subscriptions = stats.subscriptions,
                    pending_auth = stats.pending_auth,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
