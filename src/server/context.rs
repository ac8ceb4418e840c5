// src/server/context.rs

use crate::core::cluster::ClusterController;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Holds all the initialized state required to run the daemon's main loop.
pub struct ServerContext {
    pub controller: Arc<ClusterController>,
    pub listener: TcpListener,
    pub metrics_enabled: bool,
}
