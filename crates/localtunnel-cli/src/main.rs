//! lt - expose a local port through a localtunnel server

use anyhow::{Context, Result};
use clap::Parser;
use localtunnel_cli::{init_logging, Cli};
use localtunnel_client::SessionController;
use tracing::{info, warn};

/// Resolves on Ctrl+C. If the handler cannot be installed, never resolves.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Interrupted, stopping tunnel...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level())?;

    let config = cli.tunnel_config()?;
    info!(
        "Exposing {}:{} via {}",
        config.local_host, config.local_port, config.server_url
    );
    if let Some(proxy) = &config.proxy {
        info!("Using HTTP proxy {}", proxy.address());
    }

    let session = SessionController::new(config);

    let url = tokio::select! {
        url = session.connect() => url.context("Failed to get a tunnel assignment")?,
        _ = ctrl_c() => return Ok(()),
    };
    println!("your url is: {}", url);

    let summary = session
        .serve(ctrl_c())
        .await
        .context("Tunnel stopped with an error")?;

    info!(
        "Tunnel closed ({} of {} connection(s) completed)",
        summary.completed, summary.spawned
    );

    Ok(())
}
