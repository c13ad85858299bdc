use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use clap::Parser;
use log::info;
use stream_downloader::api::{self, AppState};
use stream_downloader::config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "stream-downloader", version, about = "Download server for video and music-streaming URLs")]
struct Args {
    /// Configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:3000
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory job directories are created in
    #[arg(short, long)]
    downloads_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    info!("Starting stream-downloader {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(dir) = args.downloads_dir {
        config.downloads_dir = dir;
    }

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {:?}", config.bind_address))?;
    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .with_context(|| format!("Cannot create downloads directory {:?}", config.downloads_dir))?;
    info!("Downloads directory: {:?}", config.downloads_dir);

    let state = AppState::new(Arc::new(config)).context("Failed to initialise download manager")?;
    api::serve(Arc::new(state), addr).await?;

    info!("Server stopped");
    Ok(())
}
