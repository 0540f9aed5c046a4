//! Gossip-based node discovery
//!
//! Every node periodically sends the list of addresses it knows to every
//! other active node, addressed to the reserved `membership` peer. The
//! receiving side installs whatever it did not know yet. Views converge
//! one hop per period.
//!
//! Wire format: one address per line, each line CRLF-terminated. A final
//! line without its CRLF is still accepted.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::message::{status, InboundMessage, ResponseCallback};
use super::messaging::Messenger;
use super::node::{Node, NodeRegistry};
use super::peer::{PeerDescriptor, PeerHandler, PeerRegistry, PeerResponse};

/// Reserved peer id of the membership handler
pub const MEMBERSHIP_PEER_ID: &str = "membership";

/// Content type of gossip bodies
pub const MEMBERSHIP_CONTENT_TYPE: &str = "text/plain";

const LINE_END: &str = "\r\n";

// ─────────────────────────────────────────────────────────────────
// Body Codec
// ─────────────────────────────────────────────────────────────────

/// Encode a list of addresses as a gossip body
pub fn build_body<S: AsRef<str>>(addresses: &[S]) -> String {
    let mut body = String::new();
    for address in addresses {
        body.push_str(address.as_ref());
        body.push_str(LINE_END);
    }
    body
}

/// Decode a gossip body into addresses.
///
/// Rejects the whole body if it is empty or any line is empty, contains
/// whitespace, or is not a `sip:`/`sips:` URI.
pub fn parse_body(body: &str) -> Result<Vec<String>> {
    let body = body.strip_suffix(LINE_END).unwrap_or(body);
    if body.is_empty() {
        return Err(Error::malformed_gossip("empty body"));
    }

    body.split(LINE_END)
        .enumerate()
        .map(|(i, line)| {
            if line.is_empty() {
                return Err(Error::malformed_gossip(format!("line {} is empty", i + 1)));
            }
            if line.chars().any(char::is_whitespace) {
                return Err(Error::malformed_gossip(format!("line {} contains whitespace", i + 1)));
            }
            if !is_sip_uri(line) {
                return Err(Error::malformed_gossip(format!("line {} is not a SIP URI: {}", i + 1, line)));
            }
            Ok(line.to_string())
        })
        .collect()
}

/// Whether `address` has a `sip:` or `sips:` scheme and something after it
pub fn is_sip_uri(address: &str) -> bool {
    match address.split_once(':') {
        Some((scheme, rest)) => {
            (scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips")) && !rest.is_empty()
        }
        None => false,
    }
}

/// Install every unknown address that was not evicted recently. Returns
/// how many were new.
pub fn merge<S: AsRef<str>>(registry: &NodeRegistry, addresses: &[S]) -> Result<usize> {
    let mut learned = 0;
    for address in addresses {
        if registry.learn(address.as_ref())? {
            learned += 1;
        }
    }
    Ok(learned)
}

// ─────────────────────────────────────────────────────────────────
// Membership Peer
// ─────────────────────────────────────────────────────────────────

/// Handler registered under [`MEMBERSHIP_PEER_ID`]
pub struct MembershipHandler {
    nodes: Arc<NodeRegistry>,
    // Weak: the registry owns this handler
    peers: Weak<PeerRegistry>,
    messenger: Arc<Messenger>,
}

impl MembershipHandler {
    pub fn new(nodes: Arc<NodeRegistry>, peers: &Arc<PeerRegistry>, messenger: Arc<Messenger>) -> Self {
        Self {
            nodes,
            peers: Arc::downgrade(peers),
            messenger,
        }
    }

    /// Pass the full list on to everyone but the sender, one hop less
    fn forward(&self, sender: Option<&str>, hops: u32) {
        let Some(peer) = self.peers.upgrade().and_then(|p| p.find(MEMBERSHIP_PEER_ID)) else {
            return;
        };

        let body = build_body(&self.nodes.addresses());
        match self
            .messenger
            .broadcast(&peer, &body, sender, None, hops, Some(MEMBERSHIP_CONTENT_TYPE))
        {
            Ok(sent) => debug!(sent, hops, "Membership re-forwarded"),
            Err(e) => warn!(error = %e, "Membership re-forward incomplete"),
        }
    }
}

#[async_trait]
impl PeerHandler for MembershipHandler {
    async fn handle(&self, message: &InboundMessage, _origin: Option<&Node>) -> Result<PeerResponse> {
        let addresses = match parse_body(&message.body) {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(from = ?message.from, error = %e, "Dropping gossip body");
                return Ok(PeerResponse::ok());
            }
        };

        let learned = merge(&self.nodes, &addresses)?;
        if learned > 0 {
            info!(learned, known = self.nodes.len(), from = ?message.from, "Learned new DMQ nodes");
            if message.max_forwards > 1 {
                self.forward(message.from.as_deref(), message.max_forwards - 1);
            }
        }

        Ok(PeerResponse::ok())
    }
}

// ─────────────────────────────────────────────────────────────────
// Gossip Timer
// ─────────────────────────────────────────────────────────────────

/// Gossip schedule and limits
#[derive(Debug, Clone)]
pub struct GossipSettings {
    /// Time between two membership broadcasts
    pub interval: Duration,

    /// Hop limit put on outgoing membership messages
    pub hop_limit: u32,

    /// Evict nodes silent for longer than this; `None` keeps them forever
    pub stale_timeout: Option<Duration>,

    /// Seed nodes contacted once at startup
    pub bootstrap: Vec<String>,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            hop_limit: 1,
            stale_timeout: Some(Duration::from_secs(180)),
            bootstrap: Vec::new(),
        }
    }
}

/// Drives bootstrap discovery and the periodic membership broadcast
pub struct Gossip {
    nodes: Arc<NodeRegistry>,
    peers: Arc<PeerRegistry>,
    messenger: Arc<Messenger>,
    settings: GossipSettings,
}

impl Gossip {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        peers: Arc<PeerRegistry>,
        messenger: Arc<Messenger>,
        settings: GossipSettings,
    ) -> Self {
        Self {
            nodes,
            peers,
            messenger,
            settings,
        }
    }

    pub fn settings(&self) -> &GossipSettings {
        &self.settings
    }

    fn descriptor(&self) -> Result<Arc<PeerDescriptor>> {
        self.peers.find(MEMBERSHIP_PEER_ID).ok_or_else(|| Error::PeerNotFound {
            peer_id: MEMBERSHIP_PEER_ID.to_string(),
        })
    }

    /// Refreshes a node when it acknowledges a membership message
    fn response_callback(&self) -> Arc<dyn ResponseCallback> {
        let nodes = Arc::clone(&self.nodes);
        Arc::new(move |code: u16, node: &Node| {
            if status::is_success(code) {
                nodes.touch(&node.address);
            } else {
                debug!(node = %node.address, code, "Membership ping failed");
            }
        })
    }

    /// Prune stale nodes, then send the known list to every active node.
    /// Returns the number of sends.
    pub fn tick(&self) -> Result<usize> {
        if let Some(timeout) = self.settings.stale_timeout {
            for address in self.nodes.prune_stale(timeout) {
                info!(node = %address, "Evicted silent DMQ node");
            }
        }

        let peer = self.descriptor()?;
        let body = build_body(&self.nodes.addresses());
        self.messenger.broadcast(
            &peer,
            &body,
            None,
            Some(self.response_callback()),
            self.settings.hop_limit,
            Some(MEMBERSHIP_CONTENT_TYPE),
        )
    }

    /// Pin every seed node and send it our list once. Returns the number of
    /// seeds contacted.
    pub fn bootstrap(&self) -> Result<usize> {
        let peer = self.descriptor()?;
        let local = self.messenger.local_address().to_string();
        let mut contacted = 0;

        for seed in &self.settings.bootstrap {
            if Node::new(seed).matches(&local) {
                continue;
            }
            self.nodes.install(Node::pinned(seed))?;

            let body = build_body(&self.nodes.addresses());
            let target = self.nodes.find(seed).unwrap_or_else(|| Node::pinned(seed));
            match self.messenger.unicast(
                &peer,
                &body,
                &target,
                Some(self.response_callback()),
                self.settings.hop_limit,
                Some(MEMBERSHIP_CONTENT_TYPE),
            ) {
                Ok(()) => {
                    contacted += 1;
                    info!(seed = %seed, "Bootstrap discovery sent");
                }
                Err(e) => warn!(seed = %seed, error = %e, "Bootstrap discovery failed"),
            }
        }

        Ok(contacted)
    }

    /// Run the periodic broadcast until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; bootstrap already covered it
        interval.tick().await;

        info!(interval_ms = self.settings.interval.as_millis() as u64, "Gossip timer started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick() {
                        Ok(sent) => debug!(sent, known = self.nodes.len(), "Gossip round sent"),
                        Err(e) if e.is_retryable() => warn!(error = %e, "Gossip round incomplete"),
                        Err(e) => {
                            error!(error = %e.format_for_log(), "Gossip cannot continue");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Gossip timer stopped");
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
