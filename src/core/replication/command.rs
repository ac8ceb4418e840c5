// src/core/replication/command.rs

//! A replication driver that delegates every operation to an operator-supplied
//! shell command (for example `pg_ctl promote` or `redis-cli replicaof no one`).

use super::ReplicationDriver;
use crate::config::CommandDriverConfig;
use crate::core::errors::ClusterError;
use crate::core::shell;
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone)]
pub struct CommandDriver {
    config: CommandDriverConfig,
}

impl CommandDriver {
    pub fn new(config: CommandDriverConfig) -> Self {
        Self { config }
    }

    async fn run(&self, command: &str) -> Result<String, ClusterError> {
        shell::run(command, self.config.command_timeout).await
    }

    async fn run_with(&self, template: &str, vars: &[(&str, &str)]) -> Result<String, ClusterError> {
        shell::run_template(template, vars, self.config.command_timeout).await
    }
}

/// Parses a boolean as printed by common database shells (`t`, `true`, `1`).
fn parse_bool(output: &str) -> Result<bool, ClusterError> {
    match output.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "yes" | "on" => Ok(true),
        "f" | "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ClusterError::Command(format!(
            "expected a boolean, got '{other}'"
        ))),
    }
}

#[async_trait]
impl ReplicationDriver for CommandDriver {
    async fn promote_to_main(&self) -> Result<(), ClusterError> {
        self.run(&self.config.promote)
            .await
            .map_err(|e| ClusterError::PromotionFailed(e.to_string()))?;
        info!("Data store promoted to primary.");
        Ok(())
    }

    async fn demote_to_replica(
        &self,
        new_primary_host: &str,
        slot_name: &str,
    ) -> Result<(), ClusterError> {
        self.run_with(
            &self.config.demote,
            &[("host", new_primary_host), ("slot", slot_name)],
        )
        .await
        .map_err(|e| ClusterError::DemotionFailed(e.to_string()))?;
        info!(
            "Data store now replicating from {} via slot '{}'.",
            new_primary_host, slot_name
        );
        Ok(())
    }

    async fn replication_lag_seconds(&self) -> Result<Option<f64>, ClusterError> {
        let out = self.run(&self.config.lag_seconds).await?;
        if out.is_empty() {
            return Ok(None);
        }
        out.parse::<f64>()
            .map(Some)
            .map_err(|_| ClusterError::Command(format!("invalid lag in seconds: '{out}'")))
    }

    async fn replication_lag_bytes(&self, target_host: &str) -> Result<u64, ClusterError> {
        let out = self
            .run_with(&self.config.lag_bytes, &[("target", target_host)])
            .await?;
        // Databases may print the byte difference as a decimal.
        out.parse::<f64>()
            .map(|v| v.max(0.0) as u64)
            .map_err(|_| ClusterError::Command(format!("invalid lag in bytes: '{out}'")))
    }

    async fn set_read_only(&self, read_only: bool) -> Result<(), ClusterError> {
        let cmd = if read_only {
            &self.config.read_only
        } else {
            &self.config.read_write
        };
        self.run(cmd)
            .await
            .map_err(|e| ClusterError::FencingFailed(e.to_string()))?;
        Ok(())
    }

    async fn is_in_recovery(&self) -> Result<bool, ClusterError> {
        let out = self.run(&self.config.in_recovery).await?;
        parse_bool(&out)
    }

    async fn stop_replication_link(&self, credential: &str) -> Result<(), ClusterError> {
        self.run_with(&self.config.stop_link, &[("credential", credential)])
            .await?;
        Ok(())
    }
}
