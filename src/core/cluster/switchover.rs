// src/core/cluster/switchover.rs

//! Planned, zero-data-loss exchange of the main role with a caught-up secondary.
//!
//! The main fences itself (read-only) before handing over, so no write can be
//! accepted that the new main has not seen. If the handoff request fails the
//! fence is lifted again; fencing without a completed handoff would leave the
//! whole cluster read-only.

use super::ClusterController;
use super::protocol::{PromoteEvent, PromoteRequest};
use super::state::{ApiRole, ClusterConfig, ClusterEvent, EventType, RadiusRole, ServerRole, Severity};
use crate::core::errors::ClusterError;
use crate::core::metrics;
use chrono::Utc;
use tracing::{error, info, warn};

impl ClusterController {
    /// Hands the main role to the secondary `secondary_node_id` and demotes
    /// this node to a replica of it. Must be called on the main.
    pub async fn switchover_to_secondary(&self, secondary_node_id: i64) -> Result<(), ClusterError> {
        let mut config = self.store.require_config().await?;
        if !config.is_main() {
            return Err(ClusterError::WrongRole(
                "can only initiate switchover from main server".to_string(),
            ));
        }

        let target = self
            .store
            .get_node(secondary_node_id)
            .await?
            .ok_or(ClusterError::NodeNotFound(secondary_node_id))?;
        if target.is_local(&config) {
            return Err(ClusterError::InvalidRequest(
                "target node is this server".to_string(),
            ));
        }
        if target.server_role != ServerRole::Secondary {
            return Err(ClusterError::InvalidRequest(format!(
                "node {} is a {} node, not a secondary",
                target.id, target.server_role
            )));
        }

        let _permit = self
            .failover_state
            .try_begin()
            .ok_or(ClusterError::FailoverInProgress)?;

        // --- Step 1: Verify the target has caught up ---
        let lag_bytes = self.driver.replication_lag_bytes(&target.server_ip).await?;
        let max_bytes = self.settings.max_switchover_lag_bytes;
        if lag_bytes > max_bytes {
            warn!(
                "Switchover to {} refused: {} bytes behind (max {}).",
                target.server_ip, lag_bytes, max_bytes
            );
            metrics::SWITCHOVERS_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(ClusterError::ReplicationLagTooHigh {
                lag_bytes,
                max_bytes,
            });
        }
        info!(
            "Starting switchover to node {} ({}); replication lag {} bytes.",
            target.id, target.server_ip, lag_bytes
        );
        self.record_event(
            ClusterEvent::local(
                &config,
                EventType::SwitchoverStarted,
                Severity::Warning,
                format!("Switchover to {} started", target.server_ip),
            )
            .with_node_id(target.id),
        )
        .await;

        let result = self.hand_over(&mut config, &target.server_ip).await;
        match &result {
            Ok(()) => {
                metrics::SWITCHOVERS_TOTAL.with_label_values(&["completed"]).inc();
                self.record_event(
                    ClusterEvent::local(
                        &config,
                        EventType::SwitchoverCompleted,
                        Severity::Warning,
                        format!(
                            "Switchover completed: {} is the new main, {} follows it",
                            target.server_ip, config.server_ip
                        ),
                    )
                    .with_node_id(target.id),
                )
                .await;
                info!(
                    "Switchover completed. {} is now main; this node is a secondary.",
                    target.server_ip
                );
            }
            Err(e) => {
                metrics::SWITCHOVERS_TOTAL.with_label_values(&["failed"]).inc();
                self.record_event(
                    ClusterEvent::local(
                        &config,
                        EventType::SwitchoverFailed,
                        Severity::Critical,
                        format!("Switchover to {} failed: {e}", target.server_ip),
                    )
                    .with_node_id(target.id),
                )
                .await;
            }
        }
        result
    }

    /// Steps 2 to 6: fence, settle, request promotion, demote, persist.
    async fn hand_over(&self, config: &mut ClusterConfig, target_ip: &str) -> Result<(), ClusterError> {
        // --- Step 2: Fence the primary ---
        self.driver.set_read_only(true).await.map_err(|e| match e {
            ClusterError::FencingFailed(_) => e,
            other => ClusterError::FencingFailed(other.to_string()),
        })?;
        info!("Primary fenced: data store is read-only.");

        // --- Step 3: Let in-flight replication drain ---
        tokio::time::sleep(self.settings.switchover_settle_interval).await;

        // --- Step 4: Ask the target to promote, lifting the fence on failure ---
        let request = PromoteRequest::new(PromoteEvent::Switchover, config);
        if let Err(e) = self
            .peers
            .request_promotion(target_ip, config.main_server_port, &request)
            .await
        {
            error!("Switchover promote request to {} failed: {}", target_ip, e);
            match self.driver.set_read_only(false).await {
                Ok(()) => info!("Fence lifted: data store is writable again."),
                Err(unfence_err) => error!(
                    "Failed to lift the fence after an aborted switchover: {}. The data store is still read-only and needs manual intervention.",
                    unfence_err
                ),
            }
            return Err(e);
        }
        info!("Target {} accepted the switchover.", target_ip);

        // --- Step 5: Follow the new primary ---
        let slot = config.replication_slot_name();
        self.driver
            .demote_to_replica(target_ip, &slot)
            .await
            .map_err(|e| match e {
                ClusterError::DemotionFailed(_) => e,
                other => ClusterError::DemotionFailed(other.to_string()),
            })?;

        // --- Step 6: Persist the new local role ---
        config.server_role = ServerRole::Secondary;
        config.main_server_ip = target_ip.to_string();
        config.api_role = ApiRole::Standby;
        config.radius_role = RadiusRole::Backup;
        config.last_heartbeat = Some(Utc::now());
        self.store.save_config(config).await?;
        self.failover_state.record_main_heartbeat();
        Ok(())
    }
}
