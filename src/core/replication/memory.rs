// src/core/replication/memory.rs

//! An in-process replication driver. It simulates a data store's role and
//! fencing state, and can be told to fail specific operations.

use super::ReplicationDriver;
use crate::core::errors::ClusterError;
use async_trait::async_trait;
use parking_lot::Mutex;

/// The simulated role of the data store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverRole {
    Primary,
    Replica { primary_host: String, slot: String },
}

#[derive(Debug, Clone)]
struct MemoryDriverState {
    role: DriverRole,
    read_only: bool,
    link_active: bool,
    lag_seconds: Option<f64>,
    lag_bytes: u64,
    fail_promote: bool,
    fail_demote: bool,
    fail_fence: bool,
    operations: Vec<String>,
}

#[derive(Debug)]
pub struct MemoryDriver {
    state: Mutex<MemoryDriverState>,
}

impl MemoryDriver {
    /// A driver simulating a writable primary.
    pub fn primary() -> Self {
        Self::with_role(DriverRole::Primary)
    }

    /// A driver simulating a replica following `primary_host`.
    pub fn replica(primary_host: &str) -> Self {
        let driver = Self::with_role(DriverRole::Replica {
            primary_host: primary_host.to_string(),
            slot: String::new(),
        });
        driver.state.lock().link_active = true;
        driver
    }

    fn with_role(role: DriverRole) -> Self {
        Self {
            state: Mutex::new(MemoryDriverState {
                role,
                read_only: false,
                link_active: false,
                lag_seconds: None,
                lag_bytes: 0,
                fail_promote: false,
                fail_demote: false,
                fail_fence: false,
                operations: Vec::new(),
            }),
        }
    }

    pub fn role(&self) -> DriverRole {
        self.state.lock().role.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    pub fn is_link_active(&self) -> bool {
        self.state.lock().link_active
    }

    /// The names of the operations performed so far, in call order.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .operations
            .iter()
            .filter(|op| op.as_str() == operation)
            .count()
    }

    pub fn set_lag_seconds(&self, lag: Option<f64>) {
        self.state.lock().lag_seconds = lag;
    }

    pub fn set_lag_bytes(&self, lag: u64) {
        self.state.lock().lag_bytes = lag;
    }

    pub fn fail_promote(&self, fail: bool) {
        self.state.lock().fail_promote = fail;
    }

    pub fn fail_demote(&self, fail: bool) {
        self.state.lock().fail_demote = fail;
    }

    pub fn fail_fence(&self, fail: bool) {
        self.state.lock().fail_fence = fail;
    }
}

#[async_trait]
impl ReplicationDriver for MemoryDriver {
    async fn promote_to_main(&self) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.operations.push("promote".to_string());
        if state.fail_promote {
            return Err(ClusterError::PromotionFailed(
                "simulated promotion failure".to_string(),
            ));
        }
        state.role = DriverRole::Primary;
        state.read_only = false;
        Ok(())
    }

    async fn demote_to_replica(
        &self,
        new_primary_host: &str,
        slot_name: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.operations.push("demote".to_string());
        if state.fail_demote {
            return Err(ClusterError::DemotionFailed(
                "simulated demotion failure".to_string(),
            ));
        }
        state.role = DriverRole::Replica {
            primary_host: new_primary_host.to_string(),
            slot: slot_name.to_string(),
        };
        Ok(())
    }

    async fn replication_lag_seconds(&self) -> Result<Option<f64>, ClusterError> {
        let mut state = self.state.lock();
        state.operations.push("lag_seconds".to_string());
        Ok(state.lag_seconds)
    }

    async fn replication_lag_bytes(&self, _target_host: &str) -> Result<u64, ClusterError> {
        let mut state = self.state.lock();
        state.operations.push("lag_bytes".to_string());
        Ok(state.lag_bytes)
    }

    async fn set_read_only(&self, read_only: bool) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let op = if read_only { "fence" } else { "unfence" };
        state.operations.push(op.to_string());
        if read_only && state.fail_fence {
            return Err(ClusterError::FencingFailed(
                "simulated fencing failure".to_string(),
            ));
        }
        state.read_only = read_only;
        Ok(())
    }

    async fn is_in_recovery(&self) -> Result<bool, ClusterError> {
        Ok(matches!(self.state.lock().role, DriverRole::Replica { .. }))
    }

    async fn stop_replication_link(&self, _credential: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.operations.push("stop_link".to_string());
        state.link_active = false;
        Ok(())
    }
}
