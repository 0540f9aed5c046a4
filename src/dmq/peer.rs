//! Peer registry: local handlers addressable by peer id
//!
//! Each subsystem that wants to receive DMQ messages (membership, a
//! replicated cache, presence, ...) registers one peer. Peer ids are
//! unique case-insensitively and descriptors are immutable once
//! registered.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::error::{Error, Result};

use super::message::{status, InboundMessage};
use super::node::Node;

// ─────────────────────────────────────────────────────────────────
// Peer Response
// ─────────────────────────────────────────────────────────────────

/// Reply produced by a peer handler for the sending node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerResponse {
    pub code: u16,
    pub reason: String,
    pub body: Option<String>,
    pub content_type: Option<String>,
}

impl PeerResponse {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            body: None,
            content_type: None,
        }
    }

    /// 200 OK
    pub fn ok() -> Self {
        Self::new(status::OK, status::reason(status::OK))
    }

    /// 400 Bad Request
    pub fn bad_request() -> Self {
        Self::new(status::BAD_REQUEST, status::reason(status::BAD_REQUEST))
    }

    /// 500 Server Internal Error
    pub fn server_error() -> Self {
        Self::new(status::SERVER_ERROR, status::reason(status::SERVER_ERROR))
    }

    pub fn with_body(mut self, body: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self.content_type = Some(content_type.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Handler
// ─────────────────────────────────────────────────────────────────

/// Work executed on a DMQ worker for every message addressed to a peer
#[async_trait]
pub trait PeerHandler: Send + Sync {
    /// Process one inbound message.
    ///
    /// `origin` is a snapshot of the sending node when its address is known.
    /// An `Err` is logged by the worker and answered with 500.
    async fn handle(&self, message: &InboundMessage, origin: Option<&Node>) -> Result<PeerResponse>;

    /// Called once when DMQ starts, after bootstrap discovery
    async fn on_init(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapts a plain closure into a [`PeerHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&InboundMessage, Option<&Node>) -> Result<PeerResponse> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F> PeerHandler for FnHandler<F>
where
    F: Fn(&InboundMessage, Option<&Node>) -> Result<PeerResponse> + Send + Sync + 'static,
{
    async fn handle(&self, message: &InboundMessage, origin: Option<&Node>) -> Result<PeerResponse> {
        (self.f)(message, origin)
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Descriptor
// ─────────────────────────────────────────────────────────────────

/// A registered peer. Shared read-only after registration.
pub struct PeerDescriptor {
    peer_id: String,
    description: String,
    handler: Arc<dyn PeerHandler>,
}

impl PeerDescriptor {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn handler(&self) -> Arc<dyn PeerHandler> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for PeerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDescriptor")
            .field("peer_id", &self.peer_id)
            .field("description", &self.description)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe registry of local peers
pub struct PeerRegistry {
    peers: RwLock<Vec<Arc<PeerDescriptor>>>,
}

impl PeerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Register a peer.
    ///
    /// The duplicate check and the insert happen under one write lock, so
    /// two concurrent registrations of the same id cannot both succeed.
    pub fn register(
        &self,
        peer_id: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<Arc<PeerDescriptor>> {
        let peer_id = peer_id.into();
        let mut peers = self.peers.write();

        if peers.iter().any(|p| p.peer_id.eq_ignore_ascii_case(&peer_id)) {
            return Err(Error::DuplicatePeer { peer_id });
        }

        peers
            .try_reserve(1)
            .map_err(|_| Error::allocation(format!("peer descriptor for {}", peer_id)))?;

        let descriptor = Arc::new(PeerDescriptor {
            peer_id,
            description: description.into(),
            handler,
        });
        peers.push(Arc::clone(&descriptor));

        info!(
            peer_id = %descriptor.peer_id,
            description = %descriptor.description,
            "DMQ peer registered"
        );
        Ok(descriptor)
    }

    /// Find a peer by id (case-insensitive)
    pub fn find(&self, peer_id: &str) -> Option<Arc<PeerDescriptor>> {
        self.peers
            .read()
            .iter()
            .find(|p| p.peer_id.eq_ignore_ascii_case(peer_id))
            .cloned()
    }

    /// All registered peers, in registration order
    pub fn all(&self) -> Vec<Arc<PeerDescriptor>> {
        self.peers.read().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
