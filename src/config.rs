// src/config.rs

//! Manages daemon configuration: loading from TOML, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use crate::core::cluster::state::ClusterConfig;
use std::fs;
use std::time::Duration;

/// Timing of the failover monitor.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    /// How often the main's health endpoint is polled.
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,
    /// How long the main must stay unreachable before failover is triggered.
    #[serde(with = "humantime_serde", default = "default_failover_threshold")]
    pub failover_threshold: Duration,
    /// Timeout for a single health check request.
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    pub health_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            failover_threshold: default_failover_threshold(),
            health_timeout: default_health_timeout(),
        }
    }
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_failover_threshold() -> Duration {
    Duration::from_secs(120)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Peer-to-peer control protocol settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerConfig {
    /// Timeout applied to every notification and promotion request.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// If true, peer messages must carry a valid HMAC signature, timestamp and nonce.
    #[serde(default)]
    pub require_signature: bool,
    /// How far a signed message's timestamp may drift from the local clock.
    #[serde(with = "humantime_serde", default = "default_signature_window")]
    pub signature_window: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            require_signature: false,
            signature_window: default_signature_window(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_signature_window() -> Duration {
    Duration::from_secs(300)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FailoverConfig {
    /// Replication lag above which a warning is logged before promotion.
    #[serde(with = "humantime_serde", default = "default_lag_warn_threshold")]
    pub lag_warn_threshold: Duration,
    /// Require a majority of the remaining peers to be reachable before promoting.
    #[serde(default)]
    pub require_peer_quorum: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            lag_warn_threshold: default_lag_warn_threshold(),
            require_peer_quorum: false,
        }
    }
}

fn default_lag_warn_threshold() -> Duration {
    Duration::from_secs(30)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SwitchoverConfig {
    /// Switchover is refused while the target trails by more than this many bytes.
    #[serde(default = "default_max_lag_bytes")]
    pub max_lag_bytes: u64,
    /// Pause between fencing the primary and asking the target to promote.
    #[serde(with = "humantime_serde", default = "default_settle_interval")]
    pub settle_interval: Duration,
}

impl Default for SwitchoverConfig {
    fn default() -> Self {
        Self {
            max_lag_bytes: default_max_lag_bytes(),
            settle_interval: default_settle_interval(),
        }
    }
}

fn default_max_lag_bytes() -> u64 {
    1024 * 1024 // 1 MB
}
fn default_settle_interval() -> Duration {
    Duration::from_secs(5)
}

/// Shell command templates used by the command replication driver.
///
/// Placeholders: `{host}` and `{slot}` in `demote`, `{target}` in `lag_bytes`,
/// `{credential}` in `stop_link`. Each placeholder expands to a quoted
/// environment variable reference (`"${FAILOVERD_HOST}"`), so it must not be
/// quoted again in the template.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommandDriverConfig {
    pub promote: String,
    pub demote: String,
    pub lag_seconds: String,
    pub lag_bytes: String,
    pub read_only: String,
    pub read_write: String,
    pub in_recovery: String,
    pub stop_link: String,
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Selects the replication driver backing this node.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReplicationConfig {
    /// In-process simulation, for development and single-host testing.
    #[default]
    Memory,
    Command(CommandDriverConfig),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServicesConfig {
    /// Command restarting the RADIUS service after a promotion.
    #[serde(default)]
    pub restart_radius: Option<String>,
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            restart_radius: None,
            command_timeout: default_command_timeout(),
        }
    }
}

/// Configuration for the Prometheus metrics endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, `/metrics` is served on the control port.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// The top-level daemon configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path of the JSON cluster state file. State is kept in memory if unset.
    #[serde(default)]
    pub state_file: Option<String>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub switchover: SwitchoverConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            state_file: None,
            monitor: MonitorConfig::default(),
            peer: PeerConfig::default(),
            failover: FailoverConfig::default(),
            switchover: SwitchoverConfig::default(),
            replication: ReplicationConfig::default(),
            services: ServicesConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.monitor.check_interval.is_zero() {
            return Err(anyhow!("monitor.check_interval cannot be 0"));
        }
        if self.monitor.health_timeout.is_zero() {
            return Err(anyhow!("monitor.health_timeout cannot be 0"));
        }
        if self.monitor.failover_threshold < self.monitor.check_interval {
            return Err(anyhow!(
                "monitor.failover_threshold ({:?}) must not be shorter than monitor.check_interval ({:?})",
                self.monitor.failover_threshold,
                self.monitor.check_interval
            ));
        }
        if self.peer.request_timeout.is_zero() {
            return Err(anyhow!("peer.request_timeout cannot be 0"));
        }
        if self.peer.require_signature && self.peer.signature_window.is_zero() {
            return Err(anyhow!(
                "peer.signature_window cannot be 0 when peer.require_signature is set"
            ));
        }
        if let ReplicationConfig::Command(cmds) = &self.replication {
            let templates = [
                ("promote", &cmds.promote),
                ("demote", &cmds.demote),
                ("lag_seconds", &cmds.lag_seconds),
                ("lag_bytes", &cmds.lag_bytes),
                ("read_only", &cmds.read_only),
                ("read_write", &cmds.read_write),
                ("in_recovery", &cmds.in_recovery),
                ("stop_link", &cmds.stop_link),
            ];
            for (name, template) in templates {
                if template.trim().is_empty() {
                    return Err(anyhow!("replication.{name} cannot be empty"));
                }
            }
            if cmds.command_timeout.is_zero() {
                return Err(anyhow!("replication.command_timeout cannot be 0"));
            }
        }

        if let Some(cmd) = &self.services.restart_radius
            && cmd.trim().is_empty()
        {
            return Err(anyhow!("services.restart_radius cannot be empty when set"));
        }

        Ok(())
    }

    /// Settings that are valid but probably not what the operator intended.
    /// Returned rather than logged so they can be reported once logging is up.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.monitor.health_timeout > self.monitor.check_interval {
            warnings.push(format!(
                "monitor.health_timeout ({:?}) exceeds monitor.check_interval ({:?}); health checks will overlap ticks.",
                self.monitor.health_timeout, self.monitor.check_interval
            ));
        }
        if self.switchover.max_lag_bytes == 0 {
            warnings.push(
                "switchover.max_lag_bytes is 0; switchover requires a fully caught-up secondary."
                    .to_string(),
            );
        }
        if let ReplicationConfig::Command(cmds) = &self.replication {
            let templated = [
                ("demote", &cmds.demote, "host"),
                ("demote", &cmds.demote, "slot"),
                ("lag_bytes", &cmds.lag_bytes, "target"),
                ("stop_link", &cmds.stop_link, "credential"),
            ];
            for (name, template, placeholder) in templated {
                let quoted = [format!("'{{{placeholder}}}'"), format!("\"{{{placeholder}}}\"")];
                if quoted.iter().any(|q| template.contains(q.as_str())) {
                    warnings.push(format!(
                        "replication.{name} quotes the {{{placeholder}}} placeholder; placeholders expand to quoted variables and must not be quoted again."
                    ));
                }
            }
        }
        warnings
    }

    /// Peers are always contacted on the cluster-wide control port, so a
    /// listener on any other port is unreachable to them.
    pub fn peer_port_mismatch(&self, cluster: &ClusterConfig) -> Option<String> {
        (self.port != cluster.main_server_port).then(|| {
            format!(
                "Listening on port {} but cluster '{}' contacts its members on port {}; peers will not reach this node.",
                self.port, cluster.cluster_id, cluster.main_server_port
            )
        })
    }
}
