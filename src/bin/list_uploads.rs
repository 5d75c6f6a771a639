use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use flow_gateway::app::App;
use flow_gateway::config;

#[derive(Debug, Parser)]
#[command(author, version, about = "Print one page of an owner's upload history as JSON")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    owner: i64,

    /// Cursor: id of the last row of the previous page (0 for the first page)
    #[arg(long, default_value_t = 0)]
    last_id: i64,

    #[arg(long, default_value_t = 20)]
    limit: i64,
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

    let page = app
        .history()
        .list_page(args.owner, args.last_id, args.limit)
        .await;
    app.close().await;

    let page = page?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}
