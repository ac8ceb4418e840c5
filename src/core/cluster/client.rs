// src/core/cluster/client.rs

//! The HTTP client used to talk to other cluster members: liveness polling,
//! new-main broadcasts and promotion requests. Every call carries its own timeout.

use super::protocol::{self, NotifyMessage, PeerMessage, PromoteRequest};
use crate::core::errors::ClusterError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Answers whether a node's `/health` endpoint responds with 200.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn check(&self, ip: &str, port: u16) -> Result<(), ClusterError>;
}

#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    request_timeout: Duration,
    health_timeout: Duration,
    sign_messages: bool,
}

/// Builds the base URL of a node's control endpoint.
pub fn base_url(ip: &str, port: u16) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("http://[{ip}]:{port}")
    } else {
        format!("http://{ip}:{port}")
    }
}

impl PeerClient {
    pub fn new(
        request_timeout: Duration,
        health_timeout: Duration,
        sign_messages: bool,
    ) -> Result<Self, ClusterError> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout.min(Duration::from_secs(5)))
            .build()?;
        Ok(Self {
            http,
            request_timeout,
            health_timeout,
            sign_messages,
        })
    }

    /// Sends a `new_main` announcement to a peer.
    pub async fn notify_new_main(
        &self,
        ip: &str,
        port: u16,
        message: &NotifyMessage,
    ) -> Result<(), ClusterError> {
        let url = format!("{}/cluster/notify", base_url(ip, port));
        self.post_signed(&url, message).await
    }

    /// Asks a peer to run its failover orchestrator.
    pub async fn request_promotion(
        &self,
        ip: &str,
        port: u16,
        request: &PromoteRequest,
    ) -> Result<(), ClusterError> {
        let url = format!("{}/cluster/promote", base_url(ip, port));
        self.post_signed(&url, request).await
    }

    async fn post_signed<M: PeerMessage>(&self, url: &str, message: &M) -> Result<(), ClusterError> {
        if self.sign_messages {
            let mut signed = message.clone();
            protocol::sign(&mut signed)?;
            self.post_json(url, &signed).await
        } else {
            self.post_json(url, message).await
        }
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), ClusterError> {
        let res = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| ClusterError::PeerRequestFailed(format!("{url}: {e}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ClusterError::PeerRequestFailed(format!(
                "{url} responded with {status}: {}",
                body.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for PeerClient {
    async fn check(&self, ip: &str, port: u16) -> Result<(), ClusterError> {
        let url = format!("{}/health", base_url(ip, port));
        let res = self
            .http
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(ClusterError::HttpClient(format!(
                "{url} responded with status {}",
                res.status()
            )));
        }
        Ok(())
    }
}
