//! Live registry of plant nodes.
//!
//! The registry is the single source of truth for what each node last
//! reported. It is guarded by one mutex; every accessor copies data in or out
//! and releases the lock before returning, so no caller ever holds it across
//! an `.await`.
//!
//! ```text
//! ┌──────────────┐  status   ┌──────────────┐  snapshot()  ┌─────────────┐
//! │  NodeLink    │──────────▶│ NodeRegistry │─────────────▶│ Sequencer / │
//! │ (per node)   │◀──────────│   (Mutex)    │              │  monitors   │
//! └──────────────┘  command  └──────────────┘              └─────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! A poisoned lock is recovered rather than propagated; command channels
//! that have closed are treated as a disconnected node.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use hydro_core::{NodeAddress, NodeStatusPatch, PlantNode};
use hydro_protocol::NodeCommand;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod link;

pub use link::{spawn_links, LinkConfig, LinkError, NodeLink};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeAddress),

    #[error("node {0} has no open status link")]
    NotConnected(NodeAddress),
}

struct Entry {
    node: PlantNode,
    link: Option<mpsc::UnboundedSender<NodeCommand>>,
}

impl Entry {
    fn new(address: NodeAddress) -> Self {
        Self {
            node: PlantNode::new(address),
            link: None,
        }
    }
}

/// Lock-protected map of configured nodes.
#[derive(Default)]
pub struct NodeRegistry {
    entries: Mutex<BTreeMap<NodeAddress, Entry>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every address registered offline.
    pub fn with_nodes<I, A>(addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<NodeAddress>,
    {
        let registry = Self::new();
        {
            let mut entries = registry.lock();
            for address in addresses {
                let address = address.into();
                entries
                    .entry(address.clone())
                    .or_insert_with(|| Entry::new(address));
            }
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<NodeAddress, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of one node's state.
    pub fn snapshot(&self, address: &NodeAddress) -> Option<PlantNode> {
        self.lock().get(address).map(|e| e.node.clone())
    }

    /// Copies of every node, in address order.
    pub fn snapshots(&self) -> Vec<PlantNode> {
        self.lock().values().map(|e| e.node.clone()).collect()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.lock().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Merges a status push into the node and marks it online.
    pub fn apply_status(
        &self,
        address: &NodeAddress,
        patch: NodeStatusPatch,
    ) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(address)
            .ok_or_else(|| RegistryError::NodeNotFound(address.clone()))?;
        entry.node.apply(patch, Utc::now());
        Ok(())
    }

    pub fn mark_online(&self, address: &NodeAddress) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(address)
            .ok_or_else(|| RegistryError::NodeNotFound(address.clone()))?;
        let was_online = entry.node.online;
        entry.node.online = true;
        entry.node.last_seen = Some(Utc::now());
        drop(entries);
        if !was_online {
            info!(node = %address, "Node online");
        }
        Ok(())
    }

    /// Marks the node unreachable, clears `last_seen` and drops its link.
    pub fn mark_offline(&self, address: &NodeAddress) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(address)
            .ok_or_else(|| RegistryError::NodeNotFound(address.clone()))?;
        let was_online = entry.node.online;
        entry.node.online = false;
        entry.node.last_seen = None;
        entry.link = None;
        drop(entries);
        if was_online {
            warn!(node = %address, "Node offline");
        }
        Ok(())
    }

    pub fn is_online(&self, address: &NodeAddress) -> bool {
        self.lock()
            .get(address)
            .map(|e| e.node.online)
            .unwrap_or(false)
    }

    pub fn online_nodes(&self) -> Vec<NodeAddress> {
        self.lock()
            .values()
            .filter(|e| e.node.online)
            .map(|e| e.node.address.clone())
            .collect()
    }

    /// Brings the registry in line with configuration: unknown addresses
    /// are added offline, unlisted ones removed. Returns the removed ones.
    pub fn retain_configured(&self, configured: &[NodeAddress]) -> Vec<NodeAddress> {
        let mut entries = self.lock();
        let removed: Vec<NodeAddress> = entries
            .keys()
            .filter(|a| !configured.contains(a))
            .cloned()
            .collect();
        for address in &removed {
            entries.remove(address);
        }
        for address in configured {
            entries
                .entry(address.clone())
                .or_insert_with(|| Entry::new(address.clone()));
        }
        drop(entries);
        for address in &removed {
            info!(node = %address, "Node removed from configuration");
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Status links
    // ------------------------------------------------------------------------

    /// Registers the command channel of a freshly connected link.
    pub fn attach_link(
        &self,
        address: &NodeAddress,
        sender: mpsc::UnboundedSender<NodeCommand>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(address)
            .ok_or_else(|| RegistryError::NodeNotFound(address.clone()))?;
        entry.link = Some(sender);
        Ok(())
    }

    /// Queues `command` on the node's link.
    pub fn send_command(
        &self,
        address: &NodeAddress,
        command: NodeCommand,
    ) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(address)
            .ok_or_else(|| RegistryError::NodeNotFound(address.clone()))?;
        let Some(link) = &entry.link else {
            return Err(RegistryError::NotConnected(address.clone()));
        };
        if link.send(command).is_err() {
            entry.link = None;
            return Err(RegistryError::NotConnected(address.clone()));
        }
        debug!(node = %address, command = command.as_str(), "Command queued");
        Ok(())
    }

    /// Queues `command` on every open link. Returns how many took it.
    pub fn broadcast_command(&self, command: NodeCommand) -> usize {
        let mut entries = self.lock();
        let mut delivered = 0usize;
        for entry in entries.values_mut() {
            let Some(link) = &entry.link else {
                continue;
            };
            if link.send(command).is_ok() {
                delivered += 1;
            } else {
                entry.link = None;
            }
        }
        drop(entries);
        debug!(command = command.as_str(), delivered, "Command broadcast");
        delivered
    }
}
