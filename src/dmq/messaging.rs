//! Unicast and broadcast on top of the transport

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::message::{
    peer_uri, CompletionContext, OutboundRequest, ResponseCallback, Transport, CONTENT_TYPE_HEADER,
    DMQ_METHOD, MAX_FORWARDS_HEADER,
};
use super::node::{Node, NodeRegistry};
use super::peer::PeerDescriptor;

/// Sends DMQ requests to known nodes
pub struct Messenger {
    transport: Arc<dyn Transport>,
    nodes: Arc<NodeRegistry>,
    local_address: String,
}

impl Messenger {
    pub fn new(transport: Arc<dyn Transport>, nodes: Arc<NodeRegistry>, local_address: impl Into<String>) -> Self {
        Self {
            transport,
            nodes,
            local_address: local_address.into(),
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    /// Send `body` to `peer` on one node.
    ///
    /// Returns as soon as the transport accepts the request. The callback
    /// fires later, exactly once, with the completion code.
    pub fn unicast(
        &self,
        peer: &PeerDescriptor,
        body: &str,
        target: &Node,
        callback: Option<Arc<dyn ResponseCallback>>,
        max_hops: u32,
        content_type: Option<&str>,
    ) -> Result<()> {
        let call_id = Uuid::new_v4().to_string();

        let mut headers = vec![(MAX_FORWARDS_HEADER.to_string(), max_hops.to_string())];
        if let Some(ct) = content_type {
            headers.push((CONTENT_TYPE_HEADER.to_string(), ct.to_string()));
        }

        let request = OutboundRequest {
            call_id: call_id.clone(),
            method: DMQ_METHOD.to_string(),
            peer_id: peer.peer_id().to_string(),
            target: peer_uri(peer.peer_id(), &target.address),
            from: self.local_address.clone(),
            headers,
            body: body.to_string(),
        };

        let ctx = CompletionContext::new(callback, target.clone(), call_id);
        let request_target = request.target.clone();

        match self.transport.deliver(request, ctx) {
            Ok(()) => {
                debug!(peer_id = %peer.peer_id(), target = %request_target, max_hops, "DMQ request sent");
                Ok(())
            }
            Err(e @ Error::SendRejected { .. }) => Err(e),
            Err(e) => Err(Error::send_rejected(request_target, e.to_string())),
        }
    }

    /// Send `body` to `peer` on every active remote node except `except`.
    ///
    /// Iterates a snapshot of the node table, so installs are not blocked
    /// while sends are in flight. Keeps going after a rejected unicast and
    /// reports `PartialBroadcastFailure` at the end. Returns the number of
    /// accepted sends.
    pub fn broadcast(
        &self,
        peer: &PeerDescriptor,
        body: &str,
        except: Option<&str>,
        callback: Option<Arc<dyn ResponseCallback>>,
        max_hops: u32,
        content_type: Option<&str>,
    ) -> Result<usize> {
        let mut attempted = 0;
        let mut failed = 0;

        for node in self.nodes.list() {
            if node.is_local || !node.is_active() {
                continue;
            }
            if except.is_some_and(|addr| node.matches(addr)) {
                continue;
            }

            attempted += 1;
            if let Err(e) = self.unicast(peer, body, &node, callback.clone(), max_hops, content_type) {
                failed += 1;
                warn!(peer_id = %peer.peer_id(), node = %node.address, error = %e, "Broadcast send failed");
            }
        }

        if failed > 0 {
            return Err(Error::PartialBroadcastFailure { failed, attempted });
        }
        Ok(attempted)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
