use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use snapwall_server::cleanup::Reaper;
use snapwall_server::config::{Config, ConfigError};
use snapwall_server::{http, state};

#[derive(Parser, Debug)]
#[command(name = "snapwall-server", about = "Snapwall photo wall server")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    http_addr: Option<SocketAddr>,

    #[arg(long)]
    upload_dir: Option<PathBuf>,

    #[arg(long)]
    data_file: Option<PathBuf>,

    #[arg(long)]
    static_dir: Option<PathBuf>,

    #[arg(long)]
    max_images: Option<usize>,

    /// Seconds an image is fully visible
    #[arg(long)]
    display_time: Option<u64>,

    /// Seconds an image fades out before it expires
    #[arg(long)]
    fadeout_time: Option<u64>,

    /// Seconds between expiry sweeps
    #[arg(long)]
    sweep_interval: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(v) = self.http_addr {
            config.http_addr = v;
        }
        if let Some(v) = self.upload_dir {
            config.upload_dir = v;
        }
        if let Some(v) = self.data_file {
            config.data_file = v;
        }
        if let Some(v) = self.static_dir {
            config.static_dir = v;
        }
        if let Some(v) = self.max_images {
            config.max_images = v;
        }
        if let Some(v) = self.display_time {
            config.display_time = v;
        }
        if let Some(v) = self.fadeout_time {
            config.fadeout_time = v;
        }
        if let Some(v) = self.sweep_interval {
            config.sweep_interval = v;
        }

        config.validated()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("snapwall_server=info".parse()?),
        )
        .init();

    let config = Args::parse().into_config()?;
    let state = Arc::new(state::AppState::new(config));

    state
        .payloads
        .ensure()
        .await
        .context("failed to create upload directory")?;

    match state.store.recover().await {
        Ok(count) => tracing::info!(
            "loaded {} images from {:?}",
            count,
            state.store.path()
        ),
        Err(e) => tracing::error!("could not check collection file: {}", e),
    }

    let reaper = Reaper::start(
        state.store.clone(),
        state.payloads.clone(),
        state.config.sweep_interval(),
    );

    let http_addr = state.config.http_addr;
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind {http_addr}"))?;
    tracing::info!(
        "HTTP server listening on {}, storing uploads in {:?}",
        http_addr,
        state.payloads.root()
    );

    let served = http::run_http_server(listener, state, shutdown_signal()).await;

    reaper.stop().await;
    served.context("HTTP server failed")
}
