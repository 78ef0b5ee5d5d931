//! Node registry: the only state shared between pump tasks.
//!
//! The router only talks to the registry through the [`Registry`] trait, so
//! the locking strategy can change without touching pump logic. The lock in
//! [`LocalRegistry`] is held for the map operation alone; callers clone the
//! inbox sender out and send on it after the lock is released.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::node::NodeState;

/// Sending half of a node's inbox.
pub type Inbox = mpsc::Sender<String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node already exists with name {0:?}")]
    Duplicate(String),

    #[error("no node registered with name {0:?}")]
    Unknown(String),

    #[error("invalid node state transition for {name:?}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: NodeState,
        to: NodeState,
    },
}

/// Snapshot of one registered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub state: NodeState,
    pub pid: Option<u32>,
}

/// Name-keyed store of node inboxes and lifecycle state.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register `name` in state `Starting` with the given inbox.
    ///
    /// Fails with [`RegistryError::Duplicate`] if a live node already holds
    /// the name. An exited node's name may be reused.
    async fn register(&self, name: &str, inbox: Inbox) -> Result<(), RegistryError>;

    /// The inbox of a live node, if any.
    async fn lookup_inbox(&self, name: &str) -> Option<Inbox>;

    /// `Starting -> Running`, recording the process id.
    async fn mark_running(&self, name: &str, pid: Option<u32>) -> Result<(), RegistryError>;

    /// Transition to `Exited` and release the inbox.
    async fn mark_exited(&self, name: &str) -> Result<(), RegistryError>;

    async fn state(&self, name: &str) -> Option<NodeState>;

    /// All registered nodes, sorted by name.
    async fn entries(&self) -> Vec<NodeInfo>;
}

// Compile-time assertion: Registry must be usable as `dyn Registry`.
const _: () = {
    fn _assert_object_safe(_: &dyn Registry) {}
};

struct Entry {
    state: NodeState,
    pid: Option<u32>,
    inbox: Option<Inbox>,
}

/// In-process registry guarded by a single mutex.
#[derive(Default)]
pub struct LocalRegistry {
    nodes: Mutex<HashMap<String, Entry>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition<'a>(
        nodes: &'a mut HashMap<String, Entry>,
        name: &str,
        to: NodeState,
    ) -> Result<&'a mut Entry, RegistryError> {
        let entry = nodes
            .get_mut(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        if !NodeState::is_valid_transition(entry.state, to) {
            return Err(RegistryError::InvalidTransition {
                name: name.to_string(),
                from: entry.state,
                to,
            });
        }
        entry.state = to;
        Ok(entry)
    }
}

impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistry").finish_non_exhaustive()
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn register(&self, name: &str, inbox: Inbox) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.lock().await;
        if nodes.get(name).is_some_and(|e| e.state.is_live()) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        nodes.insert(
            name.to_string(),
            Entry {
                state: NodeState::Starting,
                pid: None,
                inbox: Some(inbox),
            },
        );
        Ok(())
    }

    async fn lookup_inbox(&self, name: &str) -> Option<Inbox> {
        let nodes = self.nodes.lock().await;
        nodes.get(name).and_then(|e| e.inbox.clone())
    }

    async fn mark_running(&self, name: &str, pid: Option<u32>) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.lock().await;
        let entry = Self::transition(&mut nodes, name, NodeState::Running)?;
        entry.pid = pid;
        Ok(())
    }

    async fn mark_exited(&self, name: &str) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.lock().await;
        let entry = Self::transition(&mut nodes, name, NodeState::Exited)?;
        entry.inbox = None;
        Ok(())
    }

    async fn state(&self, name: &str) -> Option<NodeState> {
        self.nodes.lock().await.get(name).map(|e| e.state)
    }

    async fn entries(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.lock().await;
        let mut infos: Vec<NodeInfo> = nodes
            .iter()
            .map(|(name, e)| NodeInfo {
                name: name.clone(),
                state: e.state,
                pid: e.pid,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
