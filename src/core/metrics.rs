// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the failover controller.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, Histogram, TextEncoder, register_counter_vec, register_gauge,
    register_histogram,
};

lazy_static! {
    /// Health checks against the current main, labeled `ok` or `failed`.
    pub static ref HEALTH_CHECKS_TOTAL: CounterVec =
        register_counter_vec!("failoverd_health_checks_total", "Health checks against the main, by result.", &["result"]).unwrap();
    /// Failover orchestrator runs, labeled `completed` or `failed`.
    pub static ref FAILOVERS_TOTAL: CounterVec =
        register_counter_vec!("failoverd_failovers_total", "Failover runs, by outcome.", &["outcome"]).unwrap();
    /// Switchover attempts, labeled `completed`, `rejected` or `failed`.
    pub static ref SWITCHOVERS_TOTAL: CounterVec =
        register_counter_vec!("failoverd_switchovers_total", "Switchover attempts, by outcome.", &["outcome"]).unwrap();
    /// New-main notifications sent to peers, labeled `ok` or `failed`.
    pub static ref PEER_NOTIFICATIONS_TOTAL: CounterVec =
        register_counter_vec!("failoverd_peer_notifications_total", "New-main notifications sent to peers, by result.", &["result"]).unwrap();
    /// 1 while a failover run holds the in-progress guard.
    pub static ref FAILOVER_IN_PROGRESS: Gauge =
        register_gauge!("failoverd_failover_in_progress", "Failover in progress (1 for true, 0 for false).").unwrap();
    /// Wall-clock duration of failover runs.
    pub static ref FAILOVER_DURATION_SECONDS: Histogram =
        register_histogram!("failoverd_failover_duration_seconds", "Duration of failover runs in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
