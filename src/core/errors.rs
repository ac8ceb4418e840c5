// src/core/errors.rs

//! Defines the primary error type for the failover controller.

use axum::http::StatusCode;
use std::sync::Arc;
use thiserror::Error;

/// Every failure the controller can surface, grouped by how it is handled:
/// configuration and authentication errors are rejected before any side effect,
/// pipeline errors abort or degrade an orchestrator run.
#[derive(Error, Debug)]
pub enum ClusterError {
    // --- Configuration errors ---
    #[error("no cluster is configured on this node")]
    NotConfigured,

    #[error("{0}")]
    WrongRole(String),

    #[error("node {0} not found in cluster")]
    NodeNotFound(i64),

    #[error("target node {id} is not online (status: {status})")]
    NodeNotOnline { id: i64, status: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a failover is already in progress on this node")]
    FailoverInProgress,

    // --- Authentication errors ---
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    // --- Fatal pipeline errors ---
    #[error("failed to promote to main: {0}")]
    PromotionFailed(String),

    #[error("failed to demote to replica: {0}")]
    DemotionFailed(String),

    #[error("failed to fence primary: {0}")]
    FencingFailed(String),

    #[error(
        "replication lag too high: {lag_bytes} bytes behind (max {max_bytes}), wait for the secondary to catch up"
    )]
    ReplicationLagTooHigh { lag_bytes: u64, max_bytes: u64 },

    #[error("peer quorum not reached: {reachable}/{required} peers reachable")]
    QuorumNotReached { reachable: usize, required: usize },

    #[error("peer request failed: {0}")]
    PeerRequestFailed(String),

    // --- Infrastructure errors ---
    #[error("storage error: {0}")]
    Storage(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("command error: {0}")]
    Command(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// The HTTP status used when this error is returned from a route handler.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::NotConfigured | ClusterError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::WrongRole(_)
            | ClusterError::NodeNotOnline { .. }
            | ClusterError::FailoverInProgress
            | ClusterError::ReplicationLagTooHigh { .. } => StatusCode::CONFLICT,
            ClusterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ClusterError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            ClusterError::PeerRequestFailed(_) | ClusterError::HttpClient(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for errors raised before any side effect was applied.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ClusterError::NotConfigured
                | ClusterError::WrongRole(_)
                | ClusterError::NodeNotFound(_)
                | ClusterError::NodeNotOnline { .. }
                | ClusterError::InvalidRequest(_)
                | ClusterError::FailoverInProgress
                | ClusterError::AuthenticationFailed(_)
                | ClusterError::ReplicationLagTooHigh { .. }
        )
    }
}

// `std::io::Error` is not cloneable, so it is kept behind an Arc.
impl Clone for ClusterError {
    fn clone(&self) -> Self {
        match self {
            ClusterError::NotConfigured => ClusterError::NotConfigured,
            ClusterError::WrongRole(s) => ClusterError::WrongRole(s.clone()),
            ClusterError::NodeNotFound(id) => ClusterError::NodeNotFound(*id),
            ClusterError::NodeNotOnline { id, status } => ClusterError::NodeNotOnline {
                id: *id,
                status: status.clone(),
            },
            ClusterError::InvalidRequest(s) => ClusterError::InvalidRequest(s.clone()),
            ClusterError::FailoverInProgress => ClusterError::FailoverInProgress,
            ClusterError::AuthenticationFailed(s) => ClusterError::AuthenticationFailed(s.clone()),
            ClusterError::PromotionFailed(s) => ClusterError::PromotionFailed(s.clone()),
            ClusterError::DemotionFailed(s) => ClusterError::DemotionFailed(s.clone()),
            ClusterError::FencingFailed(s) => ClusterError::FencingFailed(s.clone()),
            ClusterError::ReplicationLagTooHigh {
                lag_bytes,
                max_bytes,
            } => ClusterError::ReplicationLagTooHigh {
                lag_bytes: *lag_bytes,
                max_bytes: *max_bytes,
            },
            ClusterError::QuorumNotReached {
                reachable,
                required,
            } => ClusterError::QuorumNotReached {
                reachable: *reachable,
                required: *required,
            },
            ClusterError::PeerRequestFailed(s) => ClusterError::PeerRequestFailed(s.clone()),
            ClusterError::Storage(s) => ClusterError::Storage(s.clone()),
            ClusterError::HttpClient(s) => ClusterError::HttpClient(s.clone()),
            ClusterError::Io(e) => ClusterError::Io(Arc::clone(e)),
            ClusterError::Command(s) => ClusterError::Command(s.clone()),
            ClusterError::Internal(s) => ClusterError::Internal(s.clone()),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        ClusterError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Storage(format!("serialization failed: {e}"))
    }
}
