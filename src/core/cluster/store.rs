// src/core/cluster/store.rs

//! Accessors for the cluster state: the local `ClusterConfig`, the node roster
//! and the append-only event log.
//!
//! The controller only depends on the `ClusterStore` trait. `MemoryStore` keeps
//! everything in process memory; `FileStore` persists the config and roster as
//! a JSON snapshot replaced atomically on every write, and appends events to a
//! separate log.

use super::state::{ClusterConfig, ClusterEvent, ClusterNode, NodeStatus, ServerRole};
use crate::core::errors::ClusterError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    async fn load_config(&self) -> Result<Option<ClusterConfig>, ClusterError>;
    async fn save_config(&self, config: &ClusterConfig) -> Result<(), ClusterError>;
    /// Removes the local config, returning the node to standalone.
    async fn clear_config(&self) -> Result<(), ClusterError>;

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError>;
    async fn get_node(&self, id: i64) -> Result<Option<ClusterNode>, ClusterError>;
    async fn upsert_node(&self, node: ClusterNode) -> Result<(), ClusterError>;
    async fn remove_node(&self, id: i64) -> Result<(), ClusterError>;
    async fn set_node_status(&self, id: i64, status: NodeStatus) -> Result<(), ClusterError>;
    async fn set_node_role(&self, id: i64, role: ServerRole) -> Result<(), ClusterError>;

    async fn append_event(&self, event: ClusterEvent) -> Result<(), ClusterError>;
    /// Returns up to `limit` events, newest first.
    async fn recent_events(&self, limit: usize) -> Result<Vec<ClusterEvent>, ClusterError>;

    /// Loads the local config or fails with `NotConfigured`.
    async fn require_config(&self) -> Result<ClusterConfig, ClusterError> {
        self.load_config().await?.ok_or(ClusterError::NotConfigured)
    }
}

/// A store that lives entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: Mutex<Option<ClusterConfig>>,
    nodes: DashMap<i64, ClusterNode>,
    events: Mutex<Vec<ClusterEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with a config and a roster.
    pub fn with_state(config: Option<ClusterConfig>, nodes: Vec<ClusterNode>) -> Self {
        let store = Self::new();
        *store.config.lock() = config;
        for node in nodes {
            store.nodes.insert(node.id, node);
        }
        store
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn load_config(&self) -> Result<Option<ClusterConfig>, ClusterError> {
        Ok(self.config.lock().clone())
    }

    async fn save_config(&self, config: &ClusterConfig) -> Result<(), ClusterError> {
        *self.config.lock() = Some(config.clone());
        Ok(())
    }

    async fn clear_config(&self) -> Result<(), ClusterError> {
        *self.config.lock() = None;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        let mut nodes: Vec<ClusterNode> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn get_node(&self, id: i64) -> Result<Option<ClusterNode>, ClusterError> {
        Ok(self.nodes.get(&id).map(|e| e.value().clone()))
    }

    async fn upsert_node(&self, node: ClusterNode) -> Result<(), ClusterError> {
        self.nodes.insert(node.id, node);
        Ok(())
    }

    async fn remove_node(&self, id: i64) -> Result<(), ClusterError> {
        self.nodes.remove(&id);
        Ok(())
    }

    async fn set_node_status(&self, id: i64, status: NodeStatus) -> Result<(), ClusterError> {
        let mut node = self
            .nodes
            .get_mut(&id)
            .ok_or(ClusterError::NodeNotFound(id))?;
        node.status = status;
        Ok(())
    }

    async fn set_node_role(&self, id: i64, role: ServerRole) -> Result<(), ClusterError> {
        let mut node = self
            .nodes
            .get_mut(&id)
            .ok_or(ClusterError::NodeNotFound(id))?;
        node.server_role = role;
        Ok(())
    }

    async fn append_event(&self, event: ClusterEvent) -> Result<(), ClusterError> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<ClusterEvent>, ClusterError> {
        Ok(self.events.lock().iter().rev().take(limit).cloned().collect())
    }
}

/// The on-disk representation of the config and roster used by `FileStore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    config: Option<ClusterConfig>,
    #[serde(default)]
    nodes: Vec<ClusterNode>,
}

/// A store persisted as a JSON snapshot (config and roster) next to an
/// append-only JSON-lines event log.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    events_path: PathBuf,
    snapshot: tokio::sync::Mutex<StoreSnapshot>,
    events: tokio::sync::Mutex<Vec<ClusterEvent>>,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    /// The event log lives beside it with the extension `events.jsonl`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let path = path.as_ref().to_path_buf();
        let events_path = path.with_extension("events.jsonl");
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ClusterError::Storage(format!("corrupt state file '{}': {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "State file '{}' not found, starting with an empty cluster state.",
                    path.display()
                );
                StoreSnapshot::default()
            }
            Err(e) => return Err(e.into()),
        };
        let events = load_events(&events_path).await?;
        Ok(Self {
            path,
            events_path,
            snapshot: tokio::sync::Mutex::new(snapshot),
            events: tokio::sync::Mutex::new(events),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Writes the snapshot to a temporary file, syncs it and renames it over
    /// the old one.
    async fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), ClusterError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;
        debug!("Persisted cluster state to '{}'", self.path.display());
        Ok(())
    }

    async fn mutate<F>(&self, f: F) -> Result<(), ClusterError>
    where
        F: FnOnce(&mut StoreSnapshot) -> Result<(), ClusterError> + Send,
    {
        let mut snapshot = self.snapshot.lock().await;
        let mut next = snapshot.clone();
        f(&mut next)?;
        self.persist(&next).await?;
        *snapshot = next;
        Ok(())
    }
}

/// Reads the event log. A torn final line, left by a crash mid-append, is
/// dropped; any other unreadable line means the log is corrupt.
async fn load_events(path: &Path) -> Result<Vec<ClusterEvent>, ClusterError> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut events = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str::<ClusterEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) if i + 1 == lines.len() && !contents.ends_with('\n') => {
                warn!(
                    "Dropping incomplete last entry of event log '{}': {}",
                    path.display(),
                    e
                );
                // Cut the torn bytes so the next append starts on a fresh line.
                let keep = contents.rfind('\n').map_or(0, |pos| pos + 1);
                let file = fs::OpenOptions::new().write(true).open(path).await?;
                file.set_len(keep as u64).await?;
                file.sync_all().await?;
            }
            Err(e) => {
                return Err(ClusterError::Storage(format!(
                    "corrupt event log '{}' at line {}: {e}",
                    path.display(),
                    i + 1
                )));
            }
        }
    }
    Ok(events)
}

#[async_trait]
impl ClusterStore for FileStore {
    async fn load_config(&self) -> Result<Option<ClusterConfig>, ClusterError> {
        Ok(self.snapshot.lock().await.config.clone())
    }

    async fn save_config(&self, config: &ClusterConfig) -> Result<(), ClusterError> {
        let config = config.clone();
        self.mutate(move |s| {
            s.config = Some(config);
            Ok(())
        })
        .await
    }

    async fn clear_config(&self) -> Result<(), ClusterError> {
        self.mutate(|s| {
            s.config = None;
            Ok(())
        })
        .await
    }

    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        let mut nodes = self.snapshot.lock().await.nodes.clone();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn get_node(&self, id: i64) -> Result<Option<ClusterNode>, ClusterError> {
        Ok(self
            .snapshot
            .lock()
            .await
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned())
    }

    async fn upsert_node(&self, node: ClusterNode) -> Result<(), ClusterError> {
        self.mutate(move |s| {
            match s.nodes.iter_mut().find(|n| n.id == node.id) {
                Some(existing) => *existing = node,
                None => s.nodes.push(node),
            }
            Ok(())
        })
        .await
    }

    async fn remove_node(&self, id: i64) -> Result<(), ClusterError> {
        self.mutate(move |s| {
            s.nodes.retain(|n| n.id != id);
            Ok(())
        })
        .await
    }

    async fn set_node_status(&self, id: i64, status: NodeStatus) -> Result<(), ClusterError> {
        self.mutate(move |s| {
            let node = s
                .nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or(ClusterError::NodeNotFound(id))?;
            node.status = status;
            Ok(())
        })
        .await
    }

    async fn set_node_role(&self, id: i64, role: ServerRole) -> Result<(), ClusterError> {
        self.mutate(move |s| {
            let node = s
                .nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or(ClusterError::NodeNotFound(id))?;
            node.server_role = role;
            Ok(())
        })
        .await
    }

    async fn append_event(&self, event: ClusterEvent) -> Result<(), ClusterError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut events = self.events.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        events.push(event);
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<ClusterEvent>, ClusterError> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
