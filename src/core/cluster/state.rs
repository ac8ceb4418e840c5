// src/core/cluster/state.rs

//! Defines the cluster data model (local config, roster, event log) and the
//! in-memory failover state owned by each controller instance.

use crate::core::errors::ClusterError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::time::Instant;

/// The role a server plays in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServerRole {
    /// Not part of any cluster.
    #[default]
    Standalone,
    /// The single writable primary.
    Main,
    /// A replica eligible for failover.
    Secondary,
    /// A read-only reporting replica that never takes part in failover.
    Server3,
}

/// Whether this node's API accepts writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ApiRole {
    #[default]
    Active,
    Standby,
}

/// Whether this node's RADIUS service is the primary writer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RadiusRole {
    #[default]
    Primary,
    Backup,
}

/// Liveness status of a roster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Syncing,
    Offline,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// The kinds of entries written to the cluster event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    FailoverStarted,
    FailoverCompleted,
    FailoverFailed,
    ManualFailover,
    SwitchoverStarted,
    SwitchoverCompleted,
    SwitchoverFailed,
    SplitBrainSuspected,
    NodeLeft,
}

/// The local node's view of its cluster membership. One per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: String,
    /// Shared bearer credential authenticating peer control messages.
    pub cluster_secret: String,
    pub hardware_id: String,
    pub server_ip: String,
    pub server_role: ServerRole,
    pub api_role: ApiRole,
    pub radius_role: RadiusRole,
    pub main_server_ip: String,
    /// The control port every cluster member listens on.
    pub main_server_port: u16,
    pub auto_failover_enabled: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ClusterConfig {
    pub fn is_main(&self) -> bool {
        self.server_role == ServerRole::Main
    }

    /// Replication slot name used when this node follows another primary.
    pub fn replication_slot_name(&self) -> String {
        let sanitized: String = self
            .hardware_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("replica_{sanitized}")
    }

    /// A copy safe to expose over the status endpoint.
    pub fn redacted(&self) -> Self {
        Self {
            cluster_secret: "********".to_string(),
            ..self.clone()
        }
    }
}

/// A member of the replicated cluster roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: i64,
    pub server_ip: String,
    pub server_role: ServerRole,
    pub status: NodeStatus,
    pub hardware_id: String,
}

impl ClusterNode {
    /// True if this roster row describes the node owning `config`.
    pub fn is_local(&self, config: &ClusterConfig) -> bool {
        if !self.hardware_id.is_empty() && !config.hardware_id.is_empty() {
            return self.hardware_id == config.hardware_id;
        }
        self.server_ip == config.server_ip
    }
}

/// An append-only audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub cluster_id: String,
    pub event_type: EventType,
    pub node_id: Option<i64>,
    pub node_ip: String,
    pub node_role: ServerRole,
    pub description: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl ClusterEvent {
    /// Builds an event attributed to the local node described by `config`.
    pub fn local(
        config: &ClusterConfig,
        event_type: EventType,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: config.cluster_id.clone(),
            event_type,
            node_id: None,
            node_ip: config.server_ip.clone(),
            node_role: config.server_role,
            description: description.into(),
            severity,
            created_at: Utc::now(),
        }
    }

    pub fn with_node_id(mut self, node_id: i64) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// What started an orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverTrigger {
    /// The local monitor saw the main stay unreachable past the threshold.
    Monitor,
    /// A peer (usually the main, via manual failover) asked this node to promote.
    PeerRequest { current_main: String },
    /// The main is handing over its role during a planned switchover.
    Switchover { current_main: String },
}

impl FailoverTrigger {
    /// The main this node was following when the run was triggered, if known.
    pub fn reported_main(&self) -> Option<&str> {
        match self {
            FailoverTrigger::Monitor => None,
            FailoverTrigger::PeerRequest { current_main }
            | FailoverTrigger::Switchover { current_main } => Some(current_main),
        }
    }
}

impl fmt::Display for FailoverTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverTrigger::Monitor => write!(f, "automatic"),
            FailoverTrigger::PeerRequest { current_main } => {
                write!(f, "peer request from {current_main}")
            }
            FailoverTrigger::Switchover { current_main } => {
                write!(f, "switchover from {current_main}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum FailoverOutcome {
    Completed,
    Failed(ClusterError),
}

impl FailoverOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, FailoverOutcome::Completed)
    }
}

/// Published on the controller's completion channel when a run finishes.
#[derive(Debug, Clone)]
pub struct FailoverReport {
    pub trigger: FailoverTrigger,
    pub outcome: FailoverOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Per-controller failover bookkeeping: the in-progress guard and the last
/// time the main answered a health check.
#[derive(Debug)]
pub struct FailoverState {
    in_progress: Mutex<bool>,
    last_main_heartbeat: Mutex<Instant>,
}

impl Default for FailoverState {
    fn default() -> Self {
        Self {
            in_progress: Mutex::new(false),
            last_main_heartbeat: Mutex::new(Instant::now()),
        }
    }
}

impl FailoverState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically checks and sets the in-progress flag. Returns `None` if a
    /// run already holds it. The flag is cleared when the permit is dropped.
    pub fn try_begin(self: &Arc<Self>) -> Option<FailoverPermit> {
        let mut in_progress = self.in_progress.lock();
        if *in_progress {
            return None;
        }
        *in_progress = true;
        Some(FailoverPermit {
            state: Arc::clone(self),
        })
    }

    pub fn is_in_progress(&self) -> bool {
        *self.in_progress.lock()
    }

    pub fn record_main_heartbeat(&self) {
        *self.last_main_heartbeat.lock() = Instant::now();
    }

    pub fn elapsed_since_main_heartbeat(&self) -> Duration {
        self.last_main_heartbeat.lock().elapsed()
    }
}

/// Proof that the holder owns the failover in-progress flag.
#[derive(Debug)]
pub struct FailoverPermit {
    state: Arc<FailoverState>,
}

impl Drop for FailoverPermit {
    fn drop(&mut self) {
        *self.state.in_progress.lock() = false;
    }
}
