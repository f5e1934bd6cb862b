//! proglog - a replicated commit log
//!
//! Runs one cluster member until interrupted.

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use proglog_node::{Agent, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting proglog node: {}", config.node_id);
    info!("Data directory: {:?}", config.data_dir);
    if config.bootstrap() {
        info!("No join addresses given, bootstrapping a new cluster");
    } else {
        info!("Joining cluster through {:?}", config.start_join_addrs);
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let agent = Agent::new(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    agent.shutdown().await?;

    Ok(())
}
