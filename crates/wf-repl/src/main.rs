#![warn(missing_docs)]

//! Workflow replication node: pulls replication streams from the configured source clusters

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wf_repl::{ReplConfig, ReplicationNode};

#[derive(Parser)]
#[command(name = "wf-repl")]
#[command(about = "Cross-cluster replication node", long_about = None)]
struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, env = "WF_REPL_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between metrics dumps; 0 disables them.
    #[arg(long, default_value = "30")]
    metrics_interval_secs: u64,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<ReplConfig> {
    match path {
        Some(path) if path.exists() => ReplConfig::from_file(path),
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(ReplConfig::default())
        }
        None => Ok(ReplConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.print_default_config {
        print!("{}", toml::to_string_pretty(&ReplConfig::default())?);
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    tracing::info!(
        cluster = %config.cluster.local_cluster_name,
        shards = config.cluster.shard_count,
        "wf-repl starting..."
    );

    let local = ReplicationNode::in_memory(config.clone());
    let mut peers = Vec::new();
    for name in &config.cluster.source_clusters {
        let mut peer_config = config.clone();
        peer_config.cluster.local_cluster_name = name.clone();
        peer_config.cluster.source_clusters.clear();
        let peer = ReplicationNode::in_memory(peer_config);
        local.connect_to(&peer).await;
        peers.push(peer);
    }
    if peers.is_empty() {
        tracing::warn!("no source clusters configured, engine has nothing to pull");
    }

    local.engine.start().await;

    let mut ticker = (cli.metrics_interval_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(cli.metrics_interval_secs)));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("shutdown requested");
                break;
            }
            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                print!("{}", local.metrics().await.format_prometheus());
            }
        }
    }

    local.engine.stop().await;
    Ok(())
}
