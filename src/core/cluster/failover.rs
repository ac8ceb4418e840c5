// src/core/cluster/failover.rs

//! The failover orchestrator and the entry points that lead to it: automatic
//! (monitor), manual (an administrator on the main) and peer-initiated
//! (`POST /cluster/promote`).
//!
//! Steps run strictly in order. Everything from the promotion onward is
//! irreversible; if a later step fails the promotion stands and an operator has
//! to finish the job using the event log.

use super::ClusterController;
use super::protocol::{NotifyMessage, PromoteEvent, PromoteRequest};
use super::state::{
    ApiRole, ClusterConfig, ClusterEvent, EventType, FailoverOutcome, FailoverPermit,
    FailoverReport, FailoverTrigger, NodeStatus, RadiusRole, ServerRole, Severity,
};
use crate::core::errors::ClusterError;
use crate::core::metrics;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How an inbound promote request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteAck {
    Accepted,
    AlreadyInProgress,
}

impl PromoteAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromoteAck::Accepted => "accepted",
            PromoteAck::AlreadyInProgress => "already_in_progress",
        }
    }
}

impl ClusterController {
    /// Runs the orchestrator to completion while holding `permit`, records the
    /// outcome, releases the guard and publishes a report.
    pub(crate) async fn run_failover(
        self: Arc<Self>,
        trigger: FailoverTrigger,
        permit: FailoverPermit,
    ) -> FailoverOutcome {
        metrics::FAILOVER_IN_PROGRESS.set(1.0);
        let started_at = Utc::now();
        let timer = Instant::now();

        let outcome = match self.execute_failover(&trigger).await {
            Ok(()) => {
                metrics::FAILOVERS_TOTAL.with_label_values(&["completed"]).inc();
                FailoverOutcome::Completed
            }
            Err(e) => {
                error!("Failover ({}) failed: {}", trigger, e);
                metrics::FAILOVERS_TOTAL.with_label_values(&["failed"]).inc();
                if let Ok(Some(config)) = self.store.load_config().await {
                    self.record_event(ClusterEvent::local(
                        &config,
                        EventType::FailoverFailed,
                        Severity::Critical,
                        format!("Failover ({trigger}) failed: {e}"),
                    ))
                    .await;
                }
                FailoverOutcome::Failed(e)
            }
        };

        metrics::FAILOVER_DURATION_SECONDS.observe(timer.elapsed().as_secs_f64());
        metrics::FAILOVER_IN_PROGRESS.set(0.0);
        drop(permit);

        self.publish_report(FailoverReport {
            trigger,
            outcome: outcome.clone(),
            started_at,
            finished_at: Utc::now(),
        });
        outcome
    }

    async fn execute_failover(&self, trigger: &FailoverTrigger) -> Result<(), ClusterError> {
        let mut config = self.store.require_config().await?;
        let former_main_ip = trigger
            .reported_main()
            .map(str::to_string)
            .unwrap_or_else(|| config.main_server_ip.clone());

        info!(
            "Starting failover ({}): promoting {} to replace main {}",
            trigger, config.server_ip, former_main_ip
        );
        self.record_event(ClusterEvent::local(
            &config,
            EventType::FailoverStarted,
            Severity::Warning,
            format!(
                "Failover ({trigger}) started: {} replacing {former_main_ip}",
                config.server_ip
            ),
        ))
        .await;

        // --- Step 1: Assess replication lag (informational only) ---
        self.assess_replication_lag().await;

        if self.settings.require_peer_quorum {
            self.check_peer_quorum(&config, &former_main_ip).await?;
        }

        // --- Step 2: Promote the data store. Fatal on failure. ---
        info!("Promoting local data store to primary.");
        self.driver.promote_to_main().await.map_err(|e| match e {
            ClusterError::PromotionFailed(_) => e,
            other => ClusterError::PromotionFailed(other.to_string()),
        })?;
        info!("Data store promotion succeeded.");

        // --- Step 3: Detach the secondary cache from the former main ---
        if let Err(e) = self
            .driver
            .stop_replication_link(&config.cluster_secret)
            .await
        {
            warn!("Failed to stop cache replication link: {}", e);
        } else {
            info!("Cache replication link stopped.");
        }

        // --- Step 4: Persist the new local role ---
        config.server_role = ServerRole::Main;
        config.api_role = ApiRole::Active;
        config.radius_role = RadiusRole::Primary;
        config.main_server_ip = config.server_ip.clone();
        config.last_heartbeat = Some(Utc::now());
        self.store.save_config(&config).await?;
        info!("Local cluster config updated: this node is now main.");

        // --- Step 5: Update the roster ---
        if let Err(e) = self
            .update_roster_after_promotion(&config, &former_main_ip, trigger)
            .await
        {
            warn!("Failed to update cluster roster: {}", e);
        }

        // --- Step 6: Announce the new main to every other member ---
        self.broadcast_new_main(&config).await;

        // --- Step 7: Reconfigure dependent services ---
        if let Err(e) = self.services.restart_radius().await {
            warn!(
                "Failed to restart RADIUS service after promotion: {}. It may still target the old main.",
                e
            );
        }

        // --- Step 8: Record completion ---
        self.record_event(ClusterEvent::local(
            &config,
            EventType::FailoverCompleted,
            Severity::Warning,
            format!(
                "Failover ({trigger}) completed: {} is the new main",
                config.server_ip
            ),
        ))
        .await;
        info!(
            "Failover completed. {} is now the main server.",
            config.server_ip
        );
        Ok(())
    }

    async fn assess_replication_lag(&self) {
        match self.driver.replication_lag_seconds().await {
            Ok(Some(lag)) if lag > self.settings.lag_warn_threshold.as_secs_f64() => {
                warn!(
                    "Replication lag is {:.1}s (threshold {:?}); recent writes on the former main may be lost.",
                    lag, self.settings.lag_warn_threshold
                );
            }
            Ok(Some(lag)) => info!("Replication lag before promotion: {:.1}s", lag),
            Ok(None) => info!("Data store is not replicating; no lag to assess."),
            Err(e) => warn!("Could not assess replication lag: {}", e),
        }
    }

    /// Requires a strict majority of the other members, excluding the former
    /// main, to answer their health endpoint.
    async fn check_peer_quorum(
        &self,
        config: &ClusterConfig,
        former_main_ip: &str,
    ) -> Result<(), ClusterError> {
        let witnesses: Vec<_> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| !n.is_local(config) && n.server_ip != former_main_ip)
            .collect();
        let required = witnesses.len() / 2 + 1;

        let checks = witnesses
            .iter()
            .map(|n| self.probe.check(&n.server_ip, config.main_server_port));
        let reachable = join_all(checks).await.iter().filter(|r| r.is_ok()).count();

        if reachable < required {
            return Err(ClusterError::QuorumNotReached {
                reachable,
                required,
            });
        }
        info!(
            "Peer quorum confirmed: {}/{} witnesses reachable.",
            reachable,
            witnesses.len()
        );
        Ok(())
    }

    async fn update_roster_after_promotion(
        &self,
        config: &ClusterConfig,
        former_main_ip: &str,
        trigger: &FailoverTrigger,
    ) -> Result<(), ClusterError> {
        let nodes = self.store.list_nodes().await?;
        let mut found_self = false;

        for node in nodes {
            if node.is_local(config) {
                found_self = true;
                self.store.set_node_role(node.id, ServerRole::Main).await?;
                self.store.set_node_status(node.id, NodeStatus::Online).await?;
            } else if node.server_ip == former_main_ip || node.server_role == ServerRole::Main {
                if matches!(trigger, FailoverTrigger::Switchover { .. }) {
                    self.store
                        .set_node_role(node.id, ServerRole::Secondary)
                        .await?;
                    self.store
                        .set_node_status(node.id, NodeStatus::Syncing)
                        .await?;
                    info!("Roster: former main {} marked as secondary.", node.server_ip);
                } else {
                    self.store
                        .set_node_status(node.id, NodeStatus::Offline)
                        .await?;
                    info!("Roster: former main {} marked offline.", node.server_ip);
                }
            }
        }

        if !found_self {
            warn!(
                "This node ({}) has no roster entry; its role change is not reflected there.",
                config.server_ip
            );
        }
        Ok(())
    }

    async fn broadcast_new_main(&self, config: &ClusterConfig) {
        let peers: Vec<_> = match self.store.list_nodes().await {
            Ok(nodes) => nodes.into_iter().filter(|n| !n.is_local(config)).collect(),
            Err(e) => {
                warn!("Could not load roster for new-main broadcast: {}", e);
                return;
            }
        };

        let message = NotifyMessage::new_main(config, &config.server_ip);
        let sends = peers.iter().map(|peer| {
            let message = &message;
            async move {
                let result = self
                    .peers
                    .notify_new_main(&peer.server_ip, config.main_server_port, message)
                    .await;
                (peer, result)
            }
        });

        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    metrics::PEER_NOTIFICATIONS_TOTAL
                        .with_label_values(&["ok"])
                        .inc();
                    debug!("Notified {} of the new main.", peer.server_ip);
                }
                Err(e) => {
                    metrics::PEER_NOTIFICATIONS_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    warn!("Failed to notify {} of the new main: {}", peer.server_ip, e);
                }
            }
        }
    }

    /// Asks `target_node_id` to take over as main. Must be called on the main.
    /// The target runs its own failover; nothing changes locally.
    pub async fn manual_failover(&self, target_node_id: i64) -> Result<(), ClusterError> {
        let config = self.store.require_config().await?;
        if !config.is_main() {
            return Err(ClusterError::WrongRole(
                "can only initiate failover from main server".to_string(),
            ));
        }

        let target = self
            .store
            .get_node(target_node_id)
            .await?
            .ok_or(ClusterError::NodeNotFound(target_node_id))?;
        if target.status != NodeStatus::Online {
            return Err(ClusterError::NodeNotOnline {
                id: target.id,
                status: target.status.to_string(),
            });
        }
        if target.is_local(&config) {
            return Err(ClusterError::InvalidRequest(
                "target node is this server".to_string(),
            ));
        }

        info!(
            "Manual failover: asking node {} ({}) to take over as main.",
            target.id, target.server_ip
        );
        let request = PromoteRequest::new(PromoteEvent::PromoteToMain, &config);
        self.peers
            .request_promotion(&target.server_ip, config.main_server_port, &request)
            .await?;

        self.record_event(
            ClusterEvent::local(
                &config,
                EventType::ManualFailover,
                Severity::Warning,
                format!(
                    "Manual failover initiated to node {} ({})",
                    target.id, target.server_ip
                ),
            )
            .with_node_id(target.id),
        )
        .await;
        Ok(())
    }

    /// Handles an authenticated request from a peer to take over as main.
    pub async fn handle_promote_request(
        self: &Arc<Self>,
        request: &PromoteRequest,
    ) -> Result<PromoteAck, ClusterError> {
        let config = self.store.require_config().await?;
        self.authenticator.verify(request, &config)?;

        match config.server_role {
            ServerRole::Main => {
                return Err(ClusterError::WrongRole(
                    "this node is already the main server".to_string(),
                ));
            }
            ServerRole::Server3 => {
                return Err(ClusterError::WrongRole(
                    "server3 nodes do not take part in failover".to_string(),
                ));
            }
            ServerRole::Standalone | ServerRole::Secondary => {}
        }

        let trigger = match request.event {
            PromoteEvent::PromoteToMain => FailoverTrigger::PeerRequest {
                current_main: request.current_main.clone(),
            },
            PromoteEvent::Switchover => FailoverTrigger::Switchover {
                current_main: request.current_main.clone(),
            },
        };
        let is_switchover = matches!(trigger, FailoverTrigger::Switchover { .. });

        match self.trigger_failover(trigger) {
            Some(_) => {
                info!("Accepted promote request from {}.", request.current_main);
                Ok(PromoteAck::Accepted)
            }
            // The main demotes itself on acknowledgement; only a new run may acknowledge.
            None if is_switchover => {
                warn!(
                    "Refusing switchover from {}: a failover is already in progress.",
                    request.current_main
                );
                Err(ClusterError::FailoverInProgress)
            }
            None => Ok(PromoteAck::AlreadyInProgress),
        }
    }

    /// Handles a `new_main` announcement from a freshly promoted peer.
    pub async fn handle_new_main(&self, message: &NotifyMessage) -> Result<(), ClusterError> {
        let mut config = self.store.require_config().await?;
        self.authenticator.verify(message, &config)?;

        if message.new_main_ip == config.server_ip {
            debug!("Ignoring new-main announcement naming this node.");
            return Ok(());
        }

        if config.is_main() && self.failover_state.is_in_progress() {
            // A switchover from this node is handing the role over right now and
            // will record the new main itself once it has demoted.
            info!(
                "New main {} announced during an in-progress handover.",
                message.new_main_ip
            );
            return Ok(());
        }

        if config.is_main() {
            error!(
                "Node {} announced itself as main while this node is main: possible split brain.",
                message.new_main_ip
            );
            self.record_event(ClusterEvent::local(
                &config,
                EventType::SplitBrainSuspected,
                Severity::Critical,
                format!(
                    "{} announced itself as main while {} holds the main role",
                    message.new_main_ip, config.server_ip
                ),
            ))
            .await;
            return Ok(());
        }

        info!(
            "Main changed from {} to {}.",
            config.main_server_ip, message.new_main_ip
        );
        config.main_server_ip = message.new_main_ip.clone();
        config.last_heartbeat = Some(Utc::now());
        self.store.save_config(&config).await?;
        self.failover_state.record_main_heartbeat();
        Ok(())
    }
}
