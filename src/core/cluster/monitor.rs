// src/core/cluster/monitor.rs

//! The failover monitor: a background loop, active on secondaries with automatic
//! failover enabled, that polls the main's health endpoint and triggers a
//! failover once the main has been unreachable for longer than the threshold.

use super::ClusterController;
use super::state::{FailoverTrigger, ServerRole};
use crate::core::errors::ClusterError;
use crate::core::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single monitor tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The node is not an eligible secondary (or has no cluster config).
    Skipped,
    /// The main answered its health check.
    Healthy,
    /// The main is unreachable but the threshold has not been reached yet.
    Unreachable { elapsed: Duration },
    /// The threshold was reached and a failover run was started.
    FailoverTriggered,
    /// The threshold was reached but a failover is already running.
    FailoverInProgress,
}

/// True once the main has been unreachable for at least `threshold`.
pub fn threshold_exceeded(elapsed: Duration, threshold: Duration) -> bool {
    elapsed >= threshold
}

pub struct FailoverMonitor {
    controller: Arc<ClusterController>,
    check_interval: Duration,
    failover_threshold: Duration,
    was_eligible: bool,
}

/// Handle to a running monitor. `stop` waits for the loop to exit.
#[derive(Debug)]
pub struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the loop to stop and waits until it has exited. A health check
    /// already in flight is allowed to finish first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Failover monitor task panicked: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl FailoverMonitor {
    pub fn new(controller: Arc<ClusterController>) -> Self {
        let settings = controller.settings();
        Self {
            check_interval: settings.check_interval,
            failover_threshold: settings.failover_threshold,
            controller,
            was_eligible: false,
        }
    }

    /// Spawns the monitor loop. The first check runs one interval from now.
    pub fn start(mut self) -> MonitorHandle {
        self.controller.failover_state().record_main_heartbeat();
        self.was_eligible = true;
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            self.run(loop_token).await;
        });
        MonitorHandle { token, task }
    }

    async fn run(&mut self, token: CancellationToken) {
        info!(
            "Failover monitor started with check interval {:?} and failover threshold {:?}.",
            self.check_interval, self.failover_threshold
        );
        let mut interval = time::interval_at(Instant::now() + self.check_interval, self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Failover monitor stopped.");
    }

    /// Runs one health check against the main and acts on the result.
    pub async fn tick(&mut self) -> TickOutcome {
        let config = match self.controller.effective_config().await {
            Ok(config) => config,
            Err(ClusterError::NotConfigured) => {
                self.was_eligible = false;
                return TickOutcome::Skipped;
            }
            Err(e) => {
                warn!("Failover monitor could not load cluster config: {}", e);
                return TickOutcome::Skipped;
            }
        };

        let eligible = config.server_role == ServerRole::Secondary && config.auto_failover_enabled;
        if !eligible {
            if self.was_eligible {
                info!(
                    "Node is no longer an auto-failover secondary (role {}); pausing health checks.",
                    config.server_role
                );
            }
            self.was_eligible = false;
            return TickOutcome::Skipped;
        }
        if !self.was_eligible {
            // Start the outage clock fresh whenever monitoring (re)starts.
            self.controller.failover_state().record_main_heartbeat();
            self.was_eligible = true;
        }

        let probe = self
            .controller
            .probe
            .check(&config.main_server_ip, config.main_server_port)
            .await;

        match probe {
            Ok(()) => {
                metrics::HEALTH_CHECKS_TOTAL.with_label_values(&["ok"]).inc();
                self.controller.failover_state().record_main_heartbeat();
                debug!("Main {} is healthy.", config.main_server_ip);
                TickOutcome::Healthy
            }
            Err(e) => {
                metrics::HEALTH_CHECKS_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                let elapsed = self.controller.failover_state().elapsed_since_main_heartbeat();
                self.on_main_unreachable(&config.main_server_ip, elapsed, &e)
            }
        }
    }

    fn on_main_unreachable(
        &self,
        main_ip: &str,
        elapsed: Duration,
        cause: &ClusterError,
    ) -> TickOutcome {
        if !threshold_exceeded(elapsed, self.failover_threshold) {
            warn!(
                "Main {} unreachable for {:?} (failover after {:?}): {}",
                main_ip, elapsed, self.failover_threshold, cause
            );
            return TickOutcome::Unreachable { elapsed };
        }

        match self.controller.trigger_failover(FailoverTrigger::Monitor) {
            Some(_) => {
                error!(
                    "Main {} unreachable for {:?}, exceeding the {:?} threshold. Failover triggered.",
                    main_ip, elapsed, self.failover_threshold
                );
                TickOutcome::FailoverTriggered
            }
            None => {
                debug!("Main {} still unreachable; failover already running.", main_ip);
                TickOutcome::FailoverInProgress
            }
        }
    }
}
