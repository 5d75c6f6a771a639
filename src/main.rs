use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use flow_gateway::app::App;
use flow_gateway::channel::EventChannel;
use flow_gateway::config;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let app = App::open(cfg).await?;

    // One subscription, handled sequentially.
    let deliveries = app.broker.subscribe().await?;
    let consumer = app.consumer();
    let worker = tokio::spawn(consumer.run(deliveries));
    info!("flow-gateway running; press Ctrl-C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    app.broker.close().await;
    if let Err(err) = worker.await {
        error!(?err, "consumer task failed");
    }
    app.pool.close().await;
    Ok(())
}
