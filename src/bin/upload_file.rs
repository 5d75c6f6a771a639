use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use flow_gateway::app::App;
use flow_gateway::config;
use flow_gateway::model::NewUpload;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Store a local file for an owner and queue its confirmation email"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Owner (user) id the upload belongs to
    #[arg(long)]
    owner: i64,

    /// Address that receives the confirmation
    #[arg(long)]
    email: String,

    /// File to upload
    #[arg(long)]
    file: PathBuf,

    /// Stored file name; defaults to the file's base name
    #[arg(long)]
    name: Option<String>,
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

    let content = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let app = App::open(cfg).await?;
    let result = app
        .ingestion()
        .create(NewUpload {
            owner_id: args.owner,
            email_recipient: args.email,
            name,
            size: content.len() as i64,
            content,
        })
        .await;
    app.close().await;

    let file = result?;
    info!(file_id = file.id, "upload stored and queued");
    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}
