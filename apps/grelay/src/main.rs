use std::error::Error;
use std::sync::Arc;

use clap::Parser;
mod cli;
mod config_file;
use grelay_common::GlobalConfigPatch;
use grelay_core::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
use grelay_router::{ProxyState, proxy_router};
use tracing::info;

use crate::cli::Cli;
use crate::config_file::load_config_file;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("grelay failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    // Merge order: CLI/ENV > config file > defaults.
    let mut patch = match cli.config.as_deref() {
        Some(path) => load_config_file(path)?,
        None => GlobalConfigPatch::default(),
    };
    patch.overlay(cli.to_patch());
    let config = patch.into_config()?;
    info!(
        host = %config.host,
        port = config.port,
        upstream = %config.upstream_base_url,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        max_retries = config.recovery.max_retries,
        base_delay_ms = config.recovery.base_delay_ms,
        swallow_thoughts = config.recovery.swallow_thoughts_after_retry,
        "config loaded"
    );

    let client: Arc<dyn UpstreamClient> = Arc::new(WreqUpstreamClient::new(
        UpstreamClientConfig::from_global(&config),
    )?);
    let app = proxy_router(ProxyState::new(&config, client));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("grelay=info,grelay_core=info,grelay_router=info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
