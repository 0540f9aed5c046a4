//! Distributed message queue
//!
//! Gossip-based node membership plus broadcast messaging between
//! independently deployed instances. Inbound messages are routed to locally
//! registered peers and executed on a fixed worker pool, so the task that
//! received a message never runs peer code itself.
//!
//! # Components
//!
//! - [`peer`]: peer registry and the handler trait
//! - [`node`]: membership table
//! - [`worker`]: job queues and worker pool
//! - [`messaging`]: unicast and broadcast over a [`Transport`]
//! - [`membership`]: gossip codec, membership peer and timer
//!
//! All state hangs off one [`Dmq`] context. Nothing is process-global, so
//! several instances can live side by side (tests do exactly that).

pub mod membership;
pub mod message;
pub mod messaging;
pub mod node;
pub mod peer;
pub mod worker;

#[cfg(test)]
mod test_support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use membership::{Gossip, GossipSettings, MembershipHandler, MEMBERSHIP_PEER_ID};
pub use message::{
    status, CompletionContext, InboundHandler, InboundMessage, OutboundRequest, ResponseCallback, Transport,
};
pub use messaging::Messenger;
pub use node::{Node, NodeRegistry, NodeStatus};
pub use peer::{FnHandler, PeerDescriptor, PeerHandler, PeerRegistry, PeerResponse};
pub use worker::{Job, JobQueue, WorkerPool};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Runtime settings of a DMQ instance
#[derive(Debug, Clone)]
pub struct DmqConfig {
    /// Own SIP URI, advertised in gossip
    pub server_address: String,

    /// Size of the worker pool
    pub num_workers: usize,

    /// Gossip period
    pub ping_interval: Duration,

    /// Default hop limit for membership messages
    pub hop_limit: u32,

    /// Silent nodes are evicted after this long
    pub stale_timeout: Option<Duration>,

    /// Seed nodes contacted at startup
    pub bootstrap: Vec<String>,
}

impl DmqConfig {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            num_workers: 2,
            ping_interval: Duration::from_secs(60),
            hop_limit: 1,
            stale_timeout: Some(Duration::from_secs(180)),
            bootstrap: Vec::new(),
        }
    }

    pub fn with_bootstrap(mut self, seeds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.bootstrap = seeds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    fn gossip_settings(&self) -> GossipSettings {
        GossipSettings {
            interval: self.ping_interval,
            hop_limit: self.hop_limit,
            stale_timeout: self.stale_timeout,
            bootstrap: self.bootstrap.clone(),
        }
    }
}

/// Point-in-time counters for status reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmqStatus {
    pub known_nodes: usize,
    pub active_nodes: usize,
    pub peers: usize,
    pub queue_depths: Vec<usize>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

// ─────────────────────────────────────────────────────────────────
// DMQ Context
// ─────────────────────────────────────────────────────────────────

/// One DMQ instance: registries, worker pool, messenger and gossip timer
pub struct Dmq {
    config: DmqConfig,
    peers: Arc<PeerRegistry>,
    nodes: Arc<NodeRegistry>,
    pool: WorkerPool,
    messenger: Arc<Messenger>,
    gossip: Arc<Gossip>,
    shutdown_tx: watch::Sender<bool>,
    gossip_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Dmq {
    /// Build the context and register the membership peer.
    ///
    /// Nothing runs until [`Dmq::start`].
    pub fn new(config: DmqConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        if !membership::is_sip_uri(&config.server_address) {
            return Err(Error::config_field_invalid(
                "node.server_address",
                format!("not a SIP URI: {}", config.server_address),
            ));
        }

        let nodes = Arc::new(NodeRegistry::new());
        nodes.mark_self(&config.server_address)?;

        let peers = Arc::new(PeerRegistry::new());
        let messenger = Arc::new(Messenger::new(
            transport,
            Arc::clone(&nodes),
            config.server_address.clone(),
        ));

        let handler = MembershipHandler::new(Arc::clone(&nodes), &peers, Arc::clone(&messenger));
        peers.register(MEMBERSHIP_PEER_ID, "DMQ node discovery", Arc::new(handler))?;

        let pool = WorkerPool::new(config.num_workers)?;
        let gossip = Arc::new(Gossip::new(
            Arc::clone(&nodes),
            Arc::clone(&peers),
            Arc::clone(&messenger),
            config.gossip_settings(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            peers,
            nodes,
            pool,
            messenger,
            gossip,
            shutdown_tx,
            gossip_task: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &DmqConfig {
        &self.config
    }

    pub fn local_address(&self) -> &str {
        &self.config.server_address
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    pub fn status(&self) -> DmqStatus {
        let nodes = self.nodes.list();
        DmqStatus {
            known_nodes: nodes.len(),
            active_nodes: nodes.iter().filter(|n| n.is_active()).count(),
            peers: self.peers.peer_count(),
            queue_depths: self.pool.queue_depths(),
            jobs_completed: self.pool.completed_count(),
            jobs_failed: self.pool.failed_count(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Peer API
    // ─────────────────────────────────────────────────────────────

    /// Register a local peer. Fails on a duplicate id.
    pub fn register_peer(
        &self,
        peer_id: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<Arc<PeerDescriptor>> {
        self.peers.register(peer_id, description, handler)
    }

    pub fn find_peer(&self, peer_id: &str) -> Option<Arc<PeerDescriptor>> {
        self.peers.find(peer_id)
    }

    /// Send to `peer` on the node at `address`
    pub fn send(
        &self,
        peer: &PeerDescriptor,
        body: &str,
        address: &str,
        callback: Option<Arc<dyn ResponseCallback>>,
        max_hops: u32,
        content_type: Option<&str>,
    ) -> Result<()> {
        let target = self.nodes.find(address).unwrap_or_else(|| Node::new(address));
        self.messenger
            .unicast(peer, body, &target, callback, max_hops, content_type)
    }

    /// Send to `peer` on every active node except `except`
    pub fn broadcast(
        &self,
        peer: &PeerDescriptor,
        body: &str,
        except: Option<&str>,
        callback: Option<Arc<dyn ResponseCallback>>,
        max_hops: u32,
        content_type: Option<&str>,
    ) -> Result<usize> {
        self.messenger
            .broadcast(peer, body, except, callback, max_hops, content_type)
    }

    // ─────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────

    /// Route an inbound message to its peer's worker queue.
    ///
    /// Unknown peer ids fail with `PeerNotFound` and nothing is queued.
    /// Returns the index of the worker that got the job.
    pub fn dispatch(&self, message: InboundMessage) -> Result<usize> {
        let Some(peer) = self.peers.find(&message.peer_id) else {
            debug!(peer_id = %message.peer_id, from = ?message.from, "No such DMQ peer");
            return Err(Error::PeerNotFound {
                peer_id: message.peer_id,
            });
        };

        let origin = message.from.as_deref().and_then(|from| {
            self.nodes.touch(from);
            self.nodes.find(from)
        });

        self.pool.dispatch(Job::new(peer, message, origin))
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Start workers, contact seed nodes, run peer init callbacks and start
    /// the gossip timer. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.pool.start();

        match self.gossip.bootstrap() {
            Ok(contacted) => debug!(contacted, "Bootstrap discovery done"),
            Err(e) => warn!(error = %e, "Bootstrap discovery failed"),
        }

        for peer in self.peers.all() {
            if let Err(e) = peer.handler().on_init().await {
                warn!(peer_id = %peer.peer_id(), error = %e.format_for_log(), "Peer init callback failed");
            }
        }

        let gossip = Arc::clone(&self.gossip);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *self.gossip_task.lock() = Some(tokio::spawn(gossip.run(shutdown_rx)));

        info!(
            address = %self.config.server_address,
            workers = self.pool.size(),
            peers = self.peers.peer_count(),
            "DMQ started"
        );
        Ok(())
    }

    /// Stop the gossip timer and drain the worker pool
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let task = self.gossip_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Gossip task ended abnormally");
            }
        }

        self.pool.shutdown().await;
        info!("DMQ stopped");
    }
}

impl InboundHandler for Dmq {
    fn on_inbound(&self, message: InboundMessage) -> Result<()> {
        self.dispatch(message).map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
