// src/core/mod.rs

//! The central module containing the failover controller's core logic and data structures.

pub mod cluster;
pub mod errors;
pub mod metrics;
pub mod replication;
pub mod services;
pub mod shell;

pub use cluster::ClusterController;
pub use errors::ClusterError;
