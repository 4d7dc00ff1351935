/// shardkv node binary.
///
/// Reads its configuration from flags or the environment, serves the
/// kv-store API, and drains gracefully on SIGINT/SIGTERM.
use anyhow::{Context, Result};
use clap::Parser;
use shardkv::config::Config;
use shardkv::node::Node;
use std::future::IntoFuture;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Upper bound on the graceful drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    shardkv::init_logging();
    let config = Config::parse();
    info!(?config, "configured");

    let node =
        Node::new(config.address.clone(), config.initial_view()).context("failed to build node")?;

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, address = %config.address, "serving");

    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(listener, shardkv::http::router(node.clone()))
            .with_graceful_shutdown(async {
                let _ = drain_rx.await;
            })
            .into_future(),
    );

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = drain_tx.send(());
    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(finished) => finished
            .context("server task panicked")?
            .context("server error")?,
        Err(_) => warn!("drain deadline passed, exiting with connections open"),
    }

    node.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}
