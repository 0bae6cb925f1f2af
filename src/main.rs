use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use ring_dht::node::RingNode;
use ring_dht::utils::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Ring DHT node serving GET/SET/DELETE over UDP.
#[derive(Parser, Debug)]
#[command(name = "ring_dht", version)]
struct Cli {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Ring identifier (0-65535); derived from the bound address if omitted
    #[arg(long)]
    id: Option<u16>,

    /// Existing ring member to join through
    #[arg(long)]
    join: Option<SocketAddr>,

    #[arg(long)]
    forward_timeout_ms: Option<u64>,

    /// Re-announce to the successor every N milliseconds
    #[arg(long)]
    stabilize_interval_ms: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if self.id.is_some() {
            config.node_id = self.id;
        }
        if self.join.is_some() {
            config.registration = self.join;
        }
        if let Some(ms) = self.forward_timeout_ms {
            config.forward_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.stabilize_interval_ms {
            config.stabilize_interval = Some(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;
    let (mut node, shutdown) = RingNode::new(config)
        .await
        .context("starting ring node")?;
    info!("Node {} listening on {}", node.id(), node.local_addr());

    node.join().await.context("sending JOIN")?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = shutdown.send(()).await;
        }
    });

    if let Err(e) = node.run().await {
        error!("Node stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}
