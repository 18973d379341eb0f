#![warn(missing_docs)]

//! streamlink server binary

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use streamlink_server::{Collaborators, Config, Server};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Run a streamlink server.
#[derive(Debug, Parser)]
#[command(name = "streamlink", version, about)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "STREAMLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            tracing::warn!("no configuration file given, using defaults");
            Config::default()
        }
    };
    if cli.check {
        tracing::info!(server = %config.server.server_name, "configuration is valid");
        return Ok(());
    }

    tracing::info!(server = %config.server.server_name, "streamlink server starting");
    let collaborators = Collaborators::standalone(&config);
    let server = Server::start(config, collaborators).context("starting server")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    server.shutdown().await;
    tracing::info!("streamlink server stopped");
    Ok(())
}
