// src/core/replication/mod.rs

//! The replication driver: the narrow contract the controller uses to change the
//! role of the underlying replicated data store and its secondary cache link.

use crate::core::errors::ClusterError;
use async_trait::async_trait;

pub mod command;
pub mod memory;

pub use command::CommandDriver;
pub use memory::MemoryDriver;

/// Role-changing operations against the local data store.
///
/// Every call may block on external processes; implementations are expected to
/// bound their own execution time.
#[async_trait]
pub trait ReplicationDriver: Send + Sync + 'static {
    /// Stops following the current primary and starts accepting writes.
    async fn promote_to_main(&self) -> Result<(), ClusterError>;

    /// Reconfigures the data store to follow `new_primary_host`, streaming
    /// through the replication slot `slot_name`.
    async fn demote_to_replica(
        &self,
        new_primary_host: &str,
        slot_name: &str,
    ) -> Result<(), ClusterError>;

    /// Seconds this node's replay position trails its primary.
    /// `None` when the data store is not currently replicating.
    async fn replication_lag_seconds(&self) -> Result<Option<f64>, ClusterError>;

    /// Bytes between this primary's write position and `target_host`'s replay position.
    async fn replication_lag_bytes(&self, target_host: &str) -> Result<u64, ClusterError>;

    /// Switches the data store between read-only (fenced) and writable, live.
    async fn set_read_only(&self, read_only: bool) -> Result<(), ClusterError>;

    /// True if the data store is running as a replica (recovery mode).
    async fn is_in_recovery(&self) -> Result<bool, ClusterError>;

    /// Detaches the secondary cache from the primary it replicates.
    async fn stop_replication_link(&self, credential: &str) -> Result<(), ClusterError>;
}
