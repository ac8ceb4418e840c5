// src/server/initialization.rs

//! Builds the controller and its collaborators from the daemon configuration.

use super::context::ServerContext;
use crate::config::{Config, ReplicationConfig};
use crate::core::cluster::client::PeerClient;
use crate::core::cluster::protocol::PeerAuthenticator;
use crate::core::cluster::store::{ClusterStore, FileStore, MemoryStore};
use crate::core::cluster::{ClusterController, ControllerSettings};
use crate::core::replication::{CommandDriver, MemoryDriver, ReplicationDriver};
use crate::core::services::{CommandServiceManager, NoopServiceManager, ServiceManager};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Sets up the controller and binds the control listener.
pub async fn setup(config: Config) -> Result<ServerContext> {
    let controller = build_controller(&config).await?;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind control listener on {addr}"))?;
    info!("Control endpoint listening on {}", addr);

    Ok(ServerContext {
        controller,
        listener,
        metrics_enabled: config.metrics.enabled,
    })
}

/// Wires a `ClusterController` according to `config`.
pub async fn build_controller(config: &Config) -> Result<Arc<ClusterController>> {
    let store: Arc<dyn ClusterStore> = match &config.state_file {
        Some(path) => {
            let store = FileStore::open(path)
                .await
                .with_context(|| format!("Failed to open state file '{path}'"))?;
            info!(
                "Using cluster state file '{}' with event log '{}'.",
                store.path().display(),
                store.events_path().display()
            );
            Arc::new(store)
        }
        None => {
            warn!("No state_file configured; cluster state is kept in memory only.");
            Arc::new(MemoryStore::new())
        }
    };

    let driver: Arc<dyn ReplicationDriver> = match &config.replication {
        ReplicationConfig::Memory => {
            warn!("Using the in-memory replication driver; no real data store is controlled.");
            Arc::new(MemoryDriver::primary())
        }
        ReplicationConfig::Command(cmds) => Arc::new(CommandDriver::new(cmds.clone())),
    };

    let services: Arc<dyn ServiceManager> = match &config.services.restart_radius {
        Some(cmd) => Arc::new(CommandServiceManager::new(
            cmd.clone(),
            config.services.command_timeout,
        )),
        None => Arc::new(NoopServiceManager),
    };

    let peers = PeerClient::new(
        config.peer.request_timeout,
        config.monitor.health_timeout,
        config.peer.require_signature,
    )
    .context("Failed to build peer HTTP client")?;

    let controller = ClusterController::builder(store, driver)
        .services(services)
        .peer_client(peers)
        .authenticator(PeerAuthenticator::new(
            config.peer.require_signature,
            config.peer.signature_window,
        ))
        .settings(ControllerSettings::from_config(config))
        .build()?;

    match controller.store().load_config().await? {
        Some(cluster) => {
            info!(
                "Member of cluster '{}' as {} ({}), main at {}:{}, auto-failover {}.",
                cluster.cluster_id,
                cluster.server_role,
                cluster.server_ip,
                cluster.main_server_ip,
                cluster.main_server_port,
                if cluster.auto_failover_enabled { "enabled" } else { "disabled" }
            );
            if let Some(mismatch) = config.peer_port_mismatch(&cluster) {
                warn!("{}", mismatch);
            }
        }
        None => info!("No cluster configured; running standalone."),
    }

    Ok(controller)
}
