//! Message types and the transport contract
//!
//! DMQ does not transmit anything itself. Outbound requests are handed to a
//! [`Transport`] together with a [`CompletionContext`]; the transport calls
//! [`CompletionContext::complete`] exactly once when the request finishes.
//! Inbound requests arrive already parsed as [`InboundMessage`]s.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::Result;

use super::node::Node;
use super::peer::PeerResponse;

/// Request method used for every DMQ message
pub const DMQ_METHOD: &str = "KDMQ";

/// Header carrying the hop limit
pub const MAX_FORWARDS_HEADER: &str = "Max-Forwards";

/// Header carrying the body content type
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Completion status codes used by DMQ and its transports
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;

    /// Whether a completion code means the remote node accepted the request
    pub fn is_success(code: u16) -> bool {
        (200..300).contains(&code)
    }

    /// Default reason phrase for a code
    pub fn reason(code: u16) -> &'static str {
        match code {
            OK => "OK",
            BAD_REQUEST => "Bad Request",
            NOT_FOUND => "Not Found",
            REQUEST_TIMEOUT => "Request Timeout",
            SERVER_ERROR => "Server Internal Error",
            SERVICE_UNAVAILABLE => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────

/// A DMQ request received from another node, already parsed
#[derive(Debug)]
pub struct InboundMessage {
    /// Addressed peer id (user part of the request target)
    pub peer_id: String,

    /// Address of the sending node, when known
    pub from: Option<String>,

    /// Message body
    pub body: String,

    /// Body content type
    pub content_type: Option<String>,

    /// Remaining hop count
    pub max_forwards: u32,

    reply: Option<oneshot::Sender<PeerResponse>>,
}

impl InboundMessage {
    pub fn new(peer_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            from: None,
            body: body.into(),
            content_type: None,
            max_forwards: 1,
            reply: None,
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_max_forwards(mut self, max_forwards: u32) -> Self {
        self.max_forwards = max_forwards;
        self
    }

    /// Attach a reply channel; the receiver yields the peer's response
    pub fn with_reply(mut self) -> (Self, oneshot::Receiver<PeerResponse>) {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        (self, rx)
    }

    /// Detach the reply channel so it can outlive the message
    pub(crate) fn take_reply(&mut self) -> Option<oneshot::Sender<PeerResponse>> {
        self.reply.take()
    }
}

// ─────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────

/// A request handed to the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Unique id correlating the request with its response
    pub call_id: String,

    /// Always [`DMQ_METHOD`]
    pub method: String,

    /// Addressed peer id on the remote node
    pub peer_id: String,

    /// Request target: node URI with the peer id as user part
    pub target: String,

    /// Address of the sending node
    pub from: String,

    /// Control headers (hop limit, content type)
    pub headers: Vec<(String, String)>,

    /// Message body
    pub body: String,
}

impl OutboundRequest {
    /// Look up a header value (case-insensitive name)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Hop limit carried by the request; missing or invalid means 1
    pub fn max_forwards(&self) -> u32 {
        self.header(MAX_FORWARDS_HEADER)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1)
    }

    /// Convert into the inbound form seen by the receiving node
    pub fn into_inbound(self) -> InboundMessage {
        let max_forwards = self.max_forwards();
        let content_type = self.header(CONTENT_TYPE_HEADER).map(str::to_string);
        InboundMessage {
            peer_id: self.peer_id,
            from: Some(self.from),
            body: self.body,
            content_type,
            max_forwards,
            reply: None,
        }
    }
}

/// Build a request target for `peer_id` on the node at `address`.
///
/// `sip:10.0.0.2:5060` becomes `sip:usrloc@10.0.0.2:5060`; an existing user
/// part is replaced.
pub fn peer_uri(peer_id: &str, address: &str) -> String {
    let address = address.trim();
    let (scheme, rest) = match address.split_once(':') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips") => {
            (scheme, rest)
        }
        _ => ("sip", address),
    };
    let host = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    format!("{}:{}@{}", scheme, peer_id, host)
}

// ─────────────────────────────────────────────────────────────────
// Completion
// ─────────────────────────────────────────────────────────────────

/// Callback invoked when an outbound request completes
pub trait ResponseCallback: Send + Sync {
    /// `code` is the remote reply status, or 408/503 for transport failures
    fn on_response(&self, code: u16, node: &Node);
}

impl<F> ResponseCallback for F
where
    F: Fn(u16, &Node) + Send + Sync,
{
    fn on_response(&self, code: u16, node: &Node) {
        self(code, node)
    }
}

/// State tied to one outstanding unicast.
///
/// Owns a snapshot of the target node so the callback never has to go back
/// to the node registry. `complete` consumes the context, so it can fire at
/// most once.
pub struct CompletionContext {
    callback: Option<Arc<dyn ResponseCallback>>,
    node: Node,
    call_id: String,
    completed: bool,
}

impl CompletionContext {
    pub fn new(callback: Option<Arc<dyn ResponseCallback>>, node: Node, call_id: impl Into<String>) -> Self {
        Self {
            callback,
            node,
            call_id: call_id.into(),
            completed: false,
        }
    }

    /// The target node snapshot
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Report the final status of the request
    pub fn complete(mut self, code: u16) {
        self.completed = true;
        trace!(call_id = %self.call_id, node = %self.node.address, code, "Request completed");
        if let Some(callback) = self.callback.take() {
            callback.on_response(code, &self.node);
        }
    }
}

impl Drop for CompletionContext {
    fn drop(&mut self) {
        if !self.completed {
            debug!(
                call_id = %self.call_id,
                node = %self.node.address,
                "Completion context released without a response"
            );
        }
    }
}

impl std::fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionContext")
            .field("call_id", &self.call_id)
            .field("node", &self.node.address)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Contracts with the host
// ─────────────────────────────────────────────────────────────────

/// Transmits DMQ requests to remote nodes.
///
/// `deliver` must not block. Returning `Ok` means the request was accepted
/// and `ctx.complete` will be called exactly once, possibly from another
/// task. Returning `Err` means it was rejected and `ctx` is dropped.
pub trait Transport: Send + Sync {
    fn deliver(&self, request: OutboundRequest, ctx: CompletionContext) -> Result<()>;
}

/// Accepts inbound DMQ requests from a transport listener
pub trait InboundHandler: Send + Sync {
    /// `Err(PeerNotFound)` means nothing was queued and the sender should
    /// be told the destination does not exist.
    fn on_inbound(&self, message: InboundMessage) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
