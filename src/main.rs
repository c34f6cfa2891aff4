//! stq server entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use stq::{Config, Server, StqEngine};
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "stq", version, about = "Simple task queue server")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the save path
    #[arg(long)]
    save_path: Option<PathBuf>,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(save_path) = args.save_path {
        config.save_path = save_path;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    if args.check_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    log::info!("stq v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Save path: {}", config.save_path.display());

    let listen = config.listen.clone();
    let engine = StqEngine::new(config)?;
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;
    let server = Server::new(engine.service());

    tokio::select! {
        result = server.run(listener) => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    engine.shutdown();
    Ok(())
}
