// src/core/cluster/protocol.rs

//! Message types of the peer control protocol and their authentication.
//!
//! Every message carries the shared `cluster_secret`. When signing is enabled the
//! sender also attaches a timestamp, a random nonce and a hex HMAC-SHA256 of the
//! message body (with the signature field empty), keyed by the cluster secret.

use super::state::ClusterConfig;
use crate::core::errors::ClusterError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on remembered nonces; older entries are pruned first.
const MAX_TRACKED_NONCES: usize = 10_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    NewMain,
}

/// Body of `POST /cluster/notify`, broadcast by a freshly promoted main.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    pub event: NotifyEvent,
    pub new_main_ip: String,
    pub cluster_id: String,
    pub cluster_secret: String,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl NotifyMessage {
    pub fn new_main(config: &ClusterConfig, new_main_ip: &str) -> Self {
        Self {
            event: NotifyEvent::NewMain,
            new_main_ip: new_main_ip.to_string(),
            cluster_id: config.cluster_id.clone(),
            cluster_secret: config.cluster_secret.clone(),
            timestamp: Utc::now().timestamp(),
            nonce: None,
            signature: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromoteEvent {
    PromoteToMain,
    Switchover,
}

/// Body of `POST /cluster/promote`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PromoteRequest {
    pub event: PromoteEvent,
    pub current_main: String,
    pub cluster_id: String,
    pub cluster_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl PromoteRequest {
    pub fn new(event: PromoteEvent, config: &ClusterConfig) -> Self {
        Self {
            event,
            current_main: config.server_ip.clone(),
            cluster_id: config.cluster_id.clone(),
            cluster_secret: config.cluster_secret.clone(),
            timestamp: None,
            nonce: None,
            signature: None,
        }
    }
}

/// Common access to the authentication fields of a peer message.
pub trait PeerMessage: Serialize + Clone {
    fn cluster_id(&self) -> &str;
    fn cluster_secret(&self) -> &str;
    fn timestamp(&self) -> Option<i64>;
    fn nonce(&self) -> Option<&str>;
    fn signature(&self) -> Option<&str>;
    fn set_nonce(&mut self, nonce: String);
    fn set_timestamp(&mut self, timestamp: i64);
    fn set_signature(&mut self, signature: Option<String>);
}

impl PeerMessage for NotifyMessage {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }
    fn cluster_secret(&self) -> &str {
        &self.cluster_secret
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }
    fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_nonce(&mut self, nonce: String) {
        self.nonce = Some(nonce);
    }
    fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }
    fn set_signature(&mut self, signature: Option<String>) {
        self.signature = signature;
    }
}

impl PeerMessage for PromoteRequest {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }
    fn cluster_secret(&self) -> &str {
        &self.cluster_secret
    }
    fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }
    fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_nonce(&mut self, nonce: String) {
        self.nonce = Some(nonce);
    }
    fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = Some(timestamp);
    }
    fn set_signature(&mut self, signature: Option<String>) {
        self.signature = signature;
    }
}

/// Computes the hex HMAC-SHA256 of `message` with its signature field cleared.
pub fn compute_signature<M: PeerMessage>(message: &M, key: &str) -> Result<String, ClusterError> {
    let mut unsigned = message.clone();
    unsigned.set_signature(None);
    let bytes = serde_json::to_vec(&unsigned)?;

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| ClusterError::Internal("failed to create HMAC instance".to_string()))?;
    mac.update(&bytes);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Stamps `message` with the current time and a fresh nonce, then signs it.
pub fn sign<M: PeerMessage>(message: &mut M) -> Result<(), ClusterError> {
    message.set_timestamp(Utc::now().timestamp());
    message.set_nonce(uuid::Uuid::new_v4().simple().to_string());
    let signature = compute_signature(message, message.cluster_secret())?;
    message.set_signature(Some(signature));
    Ok(())
}

fn verify_signature<M: PeerMessage>(message: &M, key: &str) -> Result<bool, ClusterError> {
    let Some(signature) = message.signature() else {
        return Ok(false);
    };
    let Ok(signature) = hex::decode(signature) else {
        return Ok(false);
    };

    let mut unsigned = message.clone();
    unsigned.set_signature(None);
    let bytes = serde_json::to_vec(&unsigned)?;

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| ClusterError::Internal("failed to create HMAC instance".to_string()))?;
    mac.update(&bytes);
    Ok(mac.verify_slice(&signature).is_ok())
}

/// Checks inbound peer messages against the local cluster config.
#[derive(Debug)]
pub struct PeerAuthenticator {
    require_signature: bool,
    window: Duration,
    seen_nonces: DashMap<String, DateTime<Utc>>,
}

impl PeerAuthenticator {
    pub fn new(require_signature: bool, window: Duration) -> Self {
        Self {
            require_signature,
            window,
            seen_nonces: DashMap::new(),
        }
    }

    /// Rejects the message unless its secret (and, when required, its signature,
    /// timestamp and nonce) are valid for `local`.
    pub fn verify<M: PeerMessage>(
        &self,
        message: &M,
        local: &ClusterConfig,
    ) -> Result<(), ClusterError> {
        let secret_matches: bool = message
            .cluster_secret()
            .as_bytes()
            .ct_eq(local.cluster_secret.as_bytes())
            .into();
        if !secret_matches {
            return Err(ClusterError::AuthenticationFailed(
                "invalid cluster secret".to_string(),
            ));
        }

        if !message.cluster_id().is_empty() && message.cluster_id() != local.cluster_id {
            return Err(ClusterError::AuthenticationFailed(format!(
                "message is for cluster '{}'",
                message.cluster_id()
            )));
        }

        if !self.require_signature {
            return Ok(());
        }

        let now = Utc::now();
        let Some(timestamp) = message.timestamp() else {
            return Err(ClusterError::AuthenticationFailed(
                "missing timestamp".to_string(),
            ));
        };
        let skew = (now.timestamp() - timestamp).unsigned_abs();
        if skew > self.window.as_secs() {
            return Err(ClusterError::AuthenticationFailed(format!(
                "timestamp outside the {}s validity window",
                self.window.as_secs()
            )));
        }

        let Some(nonce) = message.nonce() else {
            return Err(ClusterError::AuthenticationFailed(
                "missing nonce".to_string(),
            ));
        };

        if !verify_signature(message, &local.cluster_secret)? {
            return Err(ClusterError::AuthenticationFailed(
                "invalid signature".to_string(),
            ));
        }

        self.prune_nonces(now);
        if self.seen_nonces.insert(nonce.to_string(), now).is_some() {
            warn!("Rejected replayed peer message (nonce {}).", nonce);
            return Err(ClusterError::AuthenticationFailed(
                "replayed message".to_string(),
            ));
        }
        Ok(())
    }

    fn prune_nonces(&self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        self.seen_nonces.retain(|_, seen_at| now - *seen_at <= window);

        if self.seen_nonces.len() >= MAX_TRACKED_NONCES {
            let mut entries: Vec<(String, DateTime<Utc>)> = self
                .seen_nonces
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect();
            entries.sort_by_key(|(_, seen_at)| *seen_at);
            let excess = entries.len() + 1 - MAX_TRACKED_NONCES;
            for (nonce, _) in entries.into_iter().take(excess) {
                self.seen_nonces.remove(&nonce);
            }
        }
    }
}
