// src/core/cluster/mod.rs

//! The failover controller: detects the loss of the main node, promotes a
//! secondary, hands the main role over during planned switchovers, and keeps the
//! local config, the roster and the event log consistent across role changes.
//!
//! # WARNING: No quorum
//!
//! Outage detection relies on a single node's view of the main's health
//! endpoint. A network partition can make a secondary promote itself while the
//! original main keeps serving writes on the other side. The optional peer
//! quorum check (`failover.require_peer_quorum`) narrows this window by
//! requiring a majority of the remaining members to be reachable, but nothing
//! arbitrates concurrent failovers started on different nodes.

use crate::config::Config;
use crate::core::errors::ClusterError;
use crate::core::replication::ReplicationDriver;
use crate::core::services::{NoopServiceManager, ServiceManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod client;
pub mod failover;
pub mod monitor;
pub mod protocol;
pub mod state;
pub mod store;
pub mod switchover;

use self::client::{HealthProbe, PeerClient};
use self::protocol::PeerAuthenticator;
use self::state::{
    ApiRole, ClusterConfig, ClusterEvent, ClusterNode, EventType, FailoverOutcome, FailoverReport,
    FailoverState, FailoverTrigger, RadiusRole, ServerRole, Severity,
};
use self::store::ClusterStore;

/// Number of events returned by `status()`.
const STATUS_EVENT_LIMIT: usize = 20;

/// Timing and threshold knobs used by the monitor and the orchestrators.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub check_interval: Duration,
    pub failover_threshold: Duration,
    pub lag_warn_threshold: Duration,
    pub require_peer_quorum: bool,
    pub max_switchover_lag_bytes: u64,
    pub switchover_settle_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            check_interval: config.monitor.check_interval,
            failover_threshold: config.monitor.failover_threshold,
            lag_warn_threshold: config.failover.lag_warn_threshold,
            require_peer_quorum: config.failover.require_peer_quorum,
            max_switchover_lag_bytes: config.switchover.max_lag_bytes,
            switchover_settle_interval: config.switchover.settle_interval,
        }
    }
}

/// A snapshot of the controller's view of the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub config: Option<ClusterConfig>,
    pub nodes: Vec<ClusterNode>,
    pub failover_in_progress: bool,
    pub recent_events: Vec<ClusterEvent>,
}

/// Owns every collaborator of the failover subsystem for one node.
pub struct ClusterController {
    pub(crate) store: Arc<dyn ClusterStore>,
    pub(crate) driver: Arc<dyn ReplicationDriver>,
    pub(crate) services: Arc<dyn ServiceManager>,
    pub(crate) peers: PeerClient,
    pub(crate) probe: Arc<dyn HealthProbe>,
    pub(crate) authenticator: PeerAuthenticator,
    pub(crate) settings: ControllerSettings,
    pub(crate) failover_state: Arc<FailoverState>,
    reports: broadcast::Sender<FailoverReport>,
}

/// Assembles a `ClusterController`, filling in defaults for anything not set.
pub struct ControllerBuilder {
    store: Arc<dyn ClusterStore>,
    driver: Arc<dyn ReplicationDriver>,
    services: Option<Arc<dyn ServiceManager>>,
    peers: Option<PeerClient>,
    probe: Option<Arc<dyn HealthProbe>>,
    authenticator: Option<PeerAuthenticator>,
    settings: ControllerSettings,
}

impl ControllerBuilder {
    pub fn services(mut self, services: Arc<dyn ServiceManager>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn peer_client(mut self, peers: PeerClient) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Overrides the probe used for health checks. Defaults to the peer client.
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn authenticator(mut self, authenticator: PeerAuthenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Arc<ClusterController>, ClusterError> {
        let defaults = Config::default();
        let peers = match self.peers {
            Some(peers) => peers,
            None => PeerClient::new(
                defaults.peer.request_timeout,
                defaults.monitor.health_timeout,
                false,
            )?,
        };
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(peers.clone()) as Arc<dyn HealthProbe>);
        let (reports, _) = broadcast::channel(16);

        Ok(Arc::new(ClusterController {
            store: self.store,
            driver: self.driver,
            services: self
                .services
                .unwrap_or_else(|| Arc::new(NoopServiceManager)),
            peers,
            probe,
            authenticator: self.authenticator.unwrap_or_else(|| {
                PeerAuthenticator::new(false, defaults.peer.signature_window)
            }),
            settings: self.settings,
            failover_state: FailoverState::new(),
            reports,
        }))
    }
}

impl ClusterController {
    pub fn builder(
        store: Arc<dyn ClusterStore>,
        driver: Arc<dyn ReplicationDriver>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            store,
            driver,
            services: None,
            peers: None,
            probe: None,
            authenticator: None,
            settings: ControllerSettings::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn failover_state(&self) -> &Arc<FailoverState> {
        &self.failover_state
    }

    /// Subscribes to the reports published when failover runs finish.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<FailoverReport> {
        self.reports.subscribe()
    }

    pub(crate) fn publish_report(&self, report: FailoverReport) {
        // No subscribers is the normal case outside of tests.
        let _ = self.reports.send(report);
    }

    /// Appends to the event log. The log is the only durable trace an operator
    /// has of a background failover, but a write failure must not abort a run.
    pub(crate) async fn record_event(&self, event: ClusterEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.store.append_event(event).await {
            error!("Failed to record '{}' event: {}", event_type, e);
        }
    }

    /// Starts a failover run on a background task unless one is already in
    /// progress, in which case this is a no-op and `None` is returned.
    pub fn trigger_failover(
        self: &Arc<Self>,
        trigger: FailoverTrigger,
    ) -> Option<JoinHandle<FailoverOutcome>> {
        let Some(permit) = self.failover_state.try_begin() else {
            info!(
                "Failover ({}) requested but one is already in progress; ignoring.",
                trigger
            );
            return None;
        };
        let controller = Arc::clone(self);
        Some(tokio::spawn(async move {
            controller.run_failover(trigger, permit).await
        }))
    }

    /// Loads the local config, correcting a stale `main` role when the data
    /// store reports that it is running as a replica.
    pub async fn effective_config(&self) -> Result<ClusterConfig, ClusterError> {
        let mut config = self.store.require_config().await?;
        if config.server_role != ServerRole::Main {
            return Ok(config);
        }

        match self.driver.is_in_recovery().await {
            Ok(true) => {
                warn!(
                    "Stored role is main but the data store is in recovery mode; correcting role to secondary."
                );
                config.server_role = ServerRole::Secondary;
                config.api_role = ApiRole::Standby;
                config.radius_role = RadiusRole::Backup;
                self.store.save_config(&config).await?;
            }
            Ok(false) => {}
            Err(e) => warn!("Could not determine data store recovery state: {}", e),
        }
        Ok(config)
    }

    /// Removes this node from its cluster, returning it to standalone.
    pub async fn leave_cluster(&self) -> Result<(), ClusterError> {
        if self.failover_state.is_in_progress() {
            return Err(ClusterError::FailoverInProgress);
        }
        let config = self.store.require_config().await?;
        self.record_event(ClusterEvent::local(
            &config,
            EventType::NodeLeft,
            Severity::Warning,
            format!("Node {} left cluster {}", config.server_ip, config.cluster_id),
        ))
        .await;
        self.store.clear_config().await?;
        info!("Left cluster '{}'; node is now standalone.", config.cluster_id);
        Ok(())
    }

    pub async fn status(&self) -> Result<ClusterStatus, ClusterError> {
        Ok(ClusterStatus {
            config: self
                .store
                .load_config()
                .await?
                .map(|config| config.redacted()),
            nodes: self.store.list_nodes().await?,
            failover_in_progress: self.failover_state.is_in_progress(),
            recent_events: self.store.recent_events(STATUS_EVENT_LIMIT).await?,
        })
    }
}
