//! Shared fixtures for the dmq unit tests

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::message::{status, CompletionContext, InboundMessage, OutboundRequest, Transport};
use super::node::Node;
use super::peer::{FnHandler, PeerHandler, PeerResponse};

/// Transport that records every request and completes it on the spot
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutboundRequest>>,
    pub reject: Mutex<Vec<String>>,
    pub reply_code: Mutex<u16>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            reject: Mutex::new(Vec::new()),
            reply_code: Mutex::new(status::OK),
        })
    }

    pub fn targets(&self) -> Vec<String> {
        self.sent.lock().iter().map(|r| r.target.clone()).collect()
    }
}

impl Transport for RecordingTransport {
    fn deliver(&self, request: OutboundRequest, ctx: CompletionContext) -> Result<()> {
        if self.reject.lock().iter().any(|t| t == &request.target) {
            return Err(Error::send_rejected(request.target, "refused"));
        }
        self.sent.lock().push(request);
        ctx.complete(*self.reply_code.lock());
        Ok(())
    }
}

pub fn ok_handler() -> Arc<dyn PeerHandler> {
    FnHandler::new(|_: &InboundMessage, _: Option<&Node>| Ok(PeerResponse::ok()))
}
