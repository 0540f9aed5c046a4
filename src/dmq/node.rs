//! Node registry: the shared membership table
//!
//! Holds one entry per known remote DMQ instance plus the local node.
//! Entries are keyed by address; `install` is an idempotent upsert.
//!
//! Evicted addresses leave a tombstone behind. Gossip cannot bring a
//! tombstoned address back; only direct evidence from the node itself
//! (an inbound message or a 2xx completion, both of which `touch` it) or
//! an explicit `install` clears it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────

/// Operational state of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Eligible for broadcasts and gossip
    Active,
    /// Kept in the table but skipped by broadcasts
    Disabled,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// A DMQ instance participating in the mesh
#[derive(Debug, Clone)]
pub struct Node {
    /// SIP URI of the instance (e.g. `sip:10.0.0.2:5060`)
    pub address: String,

    /// Current status
    pub status: NodeStatus,

    /// True for the entry describing this process
    pub is_local: bool,

    /// Bootstrap nodes are never evicted
    pub pinned: bool,

    /// Last direct evidence that the node is alive
    pub last_notification: Instant,
}

impl Node {
    /// A freshly learned remote node
    pub fn new(address: impl AsRef<str>) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            status: NodeStatus::Active,
            is_local: false,
            pinned: false,
            last_notification: Instant::now(),
        }
    }

    /// The entry describing this process
    pub fn local(address: impl AsRef<str>) -> Self {
        Self {
            is_local: true,
            pinned: true,
            ..Self::new(address)
        }
    }

    /// A bootstrap node from static configuration
    pub fn pinned(address: impl AsRef<str>) -> Self {
        Self {
            pinned: true,
            ..Self::new(address)
        }
    }

    /// Whether this entry refers to `address`
    pub fn matches(&self, address: &str) -> bool {
        same_address(&self.address, address)
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// Trim surrounding whitespace from an address
pub fn normalize_address(address: &str) -> String {
    address.trim().to_string()
}

/// Compare two node addresses (scheme and host are case-insensitive)
pub fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

// ─────────────────────────────────────────────────────────────────
// Node Registry
// ─────────────────────────────────────────────────────────────────

/// Evicted addresses stay blocked for this many stale timeouts
const TOMBSTONE_FACTOR: u32 = 2;

/// Thread-safe table of known nodes
pub struct NodeRegistry {
    nodes: RwLock<Vec<Node>>,
    // Lock order: `nodes` before `tombstones`
    tombstones: Mutex<HashMap<String, Instant>>,
}

fn tombstone_key(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            tombstones: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a node unless its address is already known.
    ///
    /// Returns `true` when a new entry was created. An existing entry keeps
    /// its timestamp and status; only the `is_local`/`pinned` flags are
    /// widened so that `mark_self` and bootstrap pinning are sticky.
    ///
    /// An explicit install clears any tombstone for the address.
    pub fn install(&self, node: Node) -> Result<bool> {
        let mut nodes = self.nodes.write();
        self.tombstones.lock().remove(&tombstone_key(&node.address));
        Self::insert(&mut nodes, node)
    }

    /// Install an address reported by another node's gossip.
    ///
    /// Returns `false` without installing when the address is already known
    /// or was evicted recently.
    pub fn learn(&self, address: &str) -> Result<bool> {
        let mut nodes = self.nodes.write();
        let key = tombstone_key(address);
        {
            let mut tombstones = self.tombstones.lock();
            match tombstones.get(&key).copied() {
                Some(expires) if Instant::now() < expires => {
                    debug!(address = %address, "Ignoring gossip about evicted node");
                    return Ok(false);
                }
                Some(_) => {
                    tombstones.remove(&key);
                }
                None => {}
            }
        }
        Self::insert(&mut nodes, Node::new(address))
    }

    fn insert(nodes: &mut Vec<Node>, node: Node) -> Result<bool> {
        if let Some(existing) = nodes.iter_mut().find(|n| n.matches(&node.address)) {
            existing.is_local |= node.is_local;
            existing.pinned |= node.pinned;
            return Ok(false);
        }

        nodes
            .try_reserve(1)
            .map_err(|_| Error::allocation(format!("node entry for {}", node.address)))?;
        debug!(address = %node.address, local = node.is_local, "Node installed");
        nodes.push(node);
        Ok(true)
    }

    /// Install a remote node learned by address
    pub fn install_address(&self, address: &str) -> Result<bool> {
        self.install(Node::new(address))
    }

    /// Record the local node so broadcasts can skip it by flag
    pub fn mark_self(&self, address: &str) -> Result<()> {
        self.install(Node::local(address))?;
        info!(address = %address, "Local node registered");
        Ok(())
    }

    /// The local node, if marked
    pub fn local(&self) -> Option<Node> {
        self.nodes.read().iter().find(|n| n.is_local).cloned()
    }

    /// Look up a node by address
    pub fn find(&self, address: &str) -> Option<Node> {
        self.nodes.read().iter().find(|n| n.matches(address)).cloned()
    }

    /// Whether an address is known
    pub fn contains(&self, address: &str) -> bool {
        self.nodes.read().iter().any(|n| n.matches(address))
    }

    /// Snapshot of every known node, in insertion order
    pub fn list(&self) -> Vec<Node> {
        self.nodes.read().clone()
    }

    /// Addresses of every known node, in insertion order
    pub fn addresses(&self) -> Vec<String> {
        self.nodes.read().iter().map(|n| n.address.clone()).collect()
    }

    /// Number of known nodes (including self)
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Remove a node by address. The local node cannot be removed.
    pub fn remove(&self, address: &str) -> Option<Node> {
        let mut nodes = self.nodes.write();
        let idx = nodes.iter().position(|n| n.matches(address) && !n.is_local)?;
        Some(nodes.remove(idx))
    }

    /// Change a node's status. Returns false for unknown addresses.
    pub fn set_status(&self, address: &str, status: NodeStatus) -> bool {
        match self.nodes.write().iter_mut().find(|n| n.matches(address)) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }

    /// Record direct evidence that `address` is alive: refresh its
    /// timestamp and lift any tombstone
    pub fn touch(&self, address: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.iter_mut().find(|n| n.matches(address)) {
            node.last_notification = Instant::now();
        }
        self.tombstones.lock().remove(&tombstone_key(address));
    }

    /// Whether gossip about `address` is currently ignored
    pub fn is_tombstoned(&self, address: &str) -> bool {
        self.tombstones
            .lock()
            .get(&tombstone_key(address))
            .is_some_and(|expires| Instant::now() < *expires)
    }

    /// Remove nodes without direct evidence of life within `timeout`.
    /// Local and pinned nodes are kept. Each removed address is tombstoned
    /// for `TOMBSTONE_FACTOR * timeout`. Returns the removed addresses.
    pub fn prune_stale(&self, timeout: Duration) -> Vec<String> {
        let mut nodes = self.nodes.write();
        let mut tombstones = self.tombstones.lock();
        let now = Instant::now();
        tombstones.retain(|_, expires| now < *expires);

        let mut removed = Vec::new();
        nodes.retain(|n| {
            let stale = !n.is_local && !n.pinned && n.last_notification.elapsed() > timeout;
            if stale {
                removed.push(n.address.clone());
            }
            !stale
        });

        let expires = now + timeout * TOMBSTONE_FACTOR;
        for address in &removed {
            tombstones.insert(tombstone_key(address), expires);
        }

        removed
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
