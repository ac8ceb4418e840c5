// src/core/services.rs

//! Reconfiguration of services that depend on which node holds the primary role.

use crate::core::errors::ClusterError;
use crate::core::shell;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Trigger point for services that must pick up a new write target after a promotion.
#[async_trait]
pub trait ServiceManager: Send + Sync + 'static {
    /// Restarts the RADIUS authentication/accounting service.
    async fn restart_radius(&self) -> Result<(), ClusterError>;
}

/// Restarts services by running configured shell commands.
#[derive(Debug, Clone)]
pub struct CommandServiceManager {
    restart_radius: String,
    timeout: Duration,
}

impl CommandServiceManager {
    pub fn new(restart_radius: String, timeout: Duration) -> Self {
        Self {
            restart_radius,
            timeout,
        }
    }
}

#[async_trait]
impl ServiceManager for CommandServiceManager {
    async fn restart_radius(&self) -> Result<(), ClusterError> {
        shell::run(&self.restart_radius, self.timeout).await?;
        info!("RADIUS service restarted.");
        Ok(())
    }
}

/// Used when no restart command is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopServiceManager;

#[async_trait]
impl ServiceManager for NoopServiceManager {
    async fn restart_radius(&self) -> Result<(), ClusterError> {
        debug!("No RADIUS restart command configured; skipping.");
        Ok(())
    }
}
