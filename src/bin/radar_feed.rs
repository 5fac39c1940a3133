//! Radar Feed - serves radar track snapshots read from a CSV file.
//!
//! In replay mode a finished recording is looped; in live mode the file is tailed as another
//! process appends to it.

use anyhow::{Context, Result};
use radar_feed::config::Config;
use radar_feed::server;
use radar_feed::snapshot::SnapshotAccessor;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        mode = %config.mode,
        csv = %config.csv_path().display(),
        "starting radar feed"
    );

    let accessor = Arc::new(SnapshotAccessor::from_config(&config));
    if !accessor.load_source(None).await {
        warn!("no CSV data loaded; serving empty snapshots until the process is restarted");
    }

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server to {addr}"))?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server::serve(listener, accessor.clone(), shutdown.clone()));

    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");

    shutdown.cancel();
    accessor.stop();

    server.await.context("HTTP server task panicked")??;
    info!("radar feed stopped");
    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
