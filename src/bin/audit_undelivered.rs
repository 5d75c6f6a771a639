use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use flow_gateway::app::App;
use flow_gateway::audit;
use flow_gateway::config;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "List uploads whose confirmation email never went out"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only rows created at least this many seconds ago
    #[arg(long, default_value_t = 300)]
    older_than_secs: i64,

    #[arg(long, default_value_t = 100)]
    limit: i64,

    /// Queue a fresh event for every listed row
    #[arg(long)]
    republish: bool,
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

    let rows = match audit::stale_undelivered(
        &app.pool,
        chrono::Duration::seconds(args.older_than_secs),
        args.limit,
    )
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            app.close().await;
            return Err(err.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&rows)?);

    if args.republish && !rows.is_empty() {
        let published = audit::republish_all(&app.ingestion(), &rows).await;
        info!(published, listed = rows.len(), "republished stale uploads");
    }

    app.close().await;
    Ok(())
}
