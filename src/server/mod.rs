// src/server/mod.rs

use crate::config::Config;
use crate::core::cluster::monitor::FailoverMonitor;
use anyhow::{Result, anyhow};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

mod context;
mod initialization;
pub mod routes;

pub use initialization::build_controller;

/// The main daemon startup function: builds the controller, starts the failover
/// monitor and serves the control endpoint until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize the controller and bind the listener.
    let ctx = initialization::setup(config).await?;

    // 2. Start the failover monitor. It idles unless this node is an
    //    auto-failover secondary.
    let monitor = FailoverMonitor::new(ctx.controller.clone()).start();

    // 3. Serve the peer and admin endpoints until a shutdown signal arrives.
    let app = routes::router(ctx.controller.clone(), ctx.metrics_enabled);
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;

    axum::serve(ctx.listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
                _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
            }
        })
        .await?;

    monitor.stop().await;
    info!("Shutdown complete.");
    Ok(())
}
