use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use shardcanary::app::CanaryNode;
use shardcanary::settings::AppConfig;
use shardcanary::{metrics, trace};

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Canary that continuously verifies shard ownership reported by a shard distributor
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// shard distributor endpoint, e.g. 127.0.0.1:7943
    #[arg(short = 'e', long = "endpoint")]
    endpoint: Option<String>,

    /// namespace for fixed shard processing
    #[arg(long = "fixed-namespace")]
    fixed_namespace: Option<String>,

    /// namespace for ephemeral shard creation testing
    #[arg(long = "ephemeral-namespace")]
    ephemeral_namespace: Option<String>,

    /// port for the canary to receive ping requests on
    #[arg(long = "canary-grpc-port")]
    canary_grpc_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = AppConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(endpoint) = args.endpoint {
        cfg.distributor.endpoint = endpoint;
    }
    if let Some(ns) = args.fixed_namespace.as_deref() {
        cfg.set_fixed_namespace(ns);
    }
    if let Some(ns) = args.ephemeral_namespace.as_deref() {
        cfg.set_ephemeral_namespace(ns);
    }
    if let Some(port) = args.canary_grpc_port {
        cfg.server.grpc_addr = format!("127.0.0.1:{port}");
    }
    cfg.validate().context("invalid configuration")?;

    let metrics = metrics::init()?;
    trace::init(cfg.logging.format)?;

    let node = tokio::select! {
        node = CanaryNode::start(&cfg, metrics) => node?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during startup");
            trace::shutdown();
            return Ok(());
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    node.shutdown().await;
    trace::shutdown();
    Ok(())
}
