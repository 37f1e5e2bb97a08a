//! Node binary: serves one workload over stdin/stdout.
//!
//! stdout carries the protocol, so logs go to stderr.

use anyhow::Context;
use clap::Parser;
use gossip_replica::{ReplicaConfig, Runtime, Workload};
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Replicated broadcast, counter and log node.
#[derive(Parser, Debug)]
#[command(name = "gossip-replica", version)]
struct Args {
    /// JSON config file
    #[arg(short, long, env = "REPLICA_CONFIG")]
    config: Option<PathBuf>,

    /// Workload to serve (overrides the config file)
    #[arg(short, long, env = "REPLICA_WORKLOAD")]
    workload: Option<Workload>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut config = match &args.config {
        Some(path) => ReplicaConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ReplicaConfig::default(),
    };
    if let Some(workload) = args.workload {
        config.workload = workload;
    }
    config.validate().context("invalid config")?;

    info!(
        workload = %config.workload,
        strategy = %config.dissemination.strategy,
        "Starting node"
    );

    let reader = BufReader::new(tokio::io::stdin());
    Runtime::run(config, reader, tokio::io::stdout()).await?;
    Ok(())
}
