//! DMQ over plain TCP
//!
//! Every request opens its own connection: connect, write one request
//! frame, wait for the matching response frame, close. The listener side
//! hands requests to an [`InboundHandler`] and answers with the peer's
//! reply once the worker is done with it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::dmq::message::{status, DMQ_METHOD};
use crate::dmq::{CompletionContext, InboundHandler, OutboundRequest, Transport};
use crate::error::{Error, Result};

use super::wire::{read_frame, write_frame, WireMessage, DEFAULT_MAX_FRAME};

/// Port used when a node URI does not carry one
pub const DEFAULT_SIP_PORT: u16 = 5060;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// TCP transport settings
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,

    /// How long to wait for the remote peer's reply
    pub response_timeout: Duration,

    /// Largest accepted frame
    pub max_frame: usize,

    /// Port assumed for URIs without one
    pub default_port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            max_frame: DEFAULT_MAX_FRAME,
            default_port: DEFAULT_SIP_PORT,
        }
    }
}

/// Extract `host:port` from a SIP URI.
///
/// Drops the scheme, user part, URI parameters and headers. Returns `None`
/// when no host is left.
pub fn socket_target(uri: &str, default_port: u16) -> Option<String> {
    let uri = uri.trim();
    let rest = match uri.split_once(':') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips") => rest,
        _ => uri,
    };
    let host_port = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
    let host_port = host_port.split([';', '?']).next().unwrap_or_default();

    if host_port.is_empty() {
        return None;
    }

    // [v6]:port or [v6]
    if let Some(v6) = host_port.strip_prefix('[') {
        let (host, tail) = v6.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        return match tail.strip_prefix(':') {
            Some(port) if port.parse::<u16>().is_ok() => Some(format!("[{}]:{}", host, port)),
            None if tail.is_empty() => Some(format!("[{}]:{}", host, default_port)),
            _ => None,
        };
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Some(host_port.to_string()),
        Some(_) => None,
        None => Some(format!("{}:{}", host_port, default_port)),
    }
}

// ─────────────────────────────────────────────────────────────────
// Client Side
// ─────────────────────────────────────────────────────────────────

/// [`Transport`] that sends each request over a fresh TCP connection
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl Transport for TcpTransport {
    fn deliver(&self, request: OutboundRequest, ctx: CompletionContext) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|_| Error::send_rejected(&request.target, "no async runtime available"))?;
        let addr = socket_target(&request.target, self.config.default_port)
            .ok_or_else(|| Error::send_rejected(&request.target, "no usable host in target"))?;

        let config = self.config.clone();
        handle.spawn(async move {
            let call_id = request.call_id.clone();
            let code = match exchange(&addr, request, &config).await {
                Ok(code) => code,
                Err(e) => {
                    debug!(call_id = %call_id, error = %e.format_for_log(), "DMQ exchange failed");
                    e.response_code()
                }
            };
            ctx.complete(code);
        });
        Ok(())
    }
}

/// Run one request/response exchange and return the remote status code
async fn exchange(addr: &str, request: OutboundRequest, config: &TcpConfig) -> Result<u16> {
    let connect_failed = |message: String| Error::ConnectionFailed {
        addr: addr.to_string(),
        message,
    };

    let mut stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(connect_failed(e.to_string())),
        Err(_) => {
            return Err(connect_failed(format!(
                "connect timed out after {}ms",
                config.connect_timeout.as_millis()
            )))
        }
    };

    match timeout(config.response_timeout, request_response(&mut stream, request, config.max_frame)).await {
        Ok(Ok(code)) => Ok(code),
        Ok(Err(e)) => Err(connect_failed(e.to_string())),
        Err(_) => Err(Error::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: config.response_timeout.as_millis() as u64,
        }),
    }
}

async fn request_response(stream: &mut TcpStream, request: OutboundRequest, max_frame: usize) -> Result<u16> {
    let call_id = request.call_id.clone();
    write_frame(stream, &WireMessage::Request(request), max_frame).await?;

    loop {
        match read_frame(stream, max_frame).await? {
            WireMessage::Response { call_id: id, code, reason } if id == call_id => {
                trace!(call_id = %call_id, code, reason = %reason, "DMQ response received");
                return Ok(code);
            }
            other => debug!(message = ?other, "Ignoring unexpected frame"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Server Side
// ─────────────────────────────────────────────────────────────────

/// Bind `addr` and feed inbound requests to `handler`.
///
/// Returns the bound address (useful with port 0) and the accept loop task.
pub async fn serve(
    addr: SocketAddr,
    handler: Arc<dyn InboundHandler>,
    config: TcpConfig,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await.map_err(|e| Error::ConnectionFailed {
        addr: addr.to_string(),
        message: format!("bind failed: {}", e),
    })?;
    let local = listener.local_addr()?;
    info!(addr = %local, "DMQ listener ready");

    let task = tokio::spawn(accept_loop(listener, handler, config));
    Ok((local, task))
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn InboundHandler>, config: TcpConfig) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                trace!(peer_addr = %peer_addr, "Inbound DMQ connection");
                let handler = Arc::clone(&handler);
                let max_frame = config.max_frame;
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handler, max_frame).await {
                        debug!(peer_addr = %peer_addr, error = %e, "Inbound connection failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn InboundHandler>,
    max_frame: usize,
) -> anyhow::Result<()> {
    loop {
        let request = match read_frame(&mut stream, max_frame).await {
            Ok(WireMessage::Request(request)) => request,
            Ok(WireMessage::Response { call_id, .. }) => {
                debug!(call_id = %call_id, "Unsolicited response frame");
                continue;
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let call_id = request.call_id.clone();
        let (code, reason) = answer(request, handler.as_ref()).await;
        let response = WireMessage::Response { call_id, code, reason };
        write_frame(&mut stream, &response, max_frame).await?;
    }
}

/// Dispatch one request and wait for the worker's reply
async fn answer(request: OutboundRequest, handler: &dyn InboundHandler) -> (u16, String) {
    if !request.method.eq_ignore_ascii_case(DMQ_METHOD) {
        let e = Error::Protocol(format!("unsupported method {}", request.method));
        debug!(call_id = %request.call_id, error = %e, "Rejecting non-DMQ request");
        let code = e.response_code();
        return (code, status::reason(code).to_string());
    }

    let (message, reply) = request.into_inbound().with_reply();
    match handler.on_inbound(message) {
        Ok(()) => match reply.await {
            Ok(response) => (response.code, response.reason),
            Err(_) => (status::SERVER_ERROR, status::reason(status::SERVER_ERROR).to_string()),
        },
        Err(e) => {
            let code = e.response_code();
            (code, status::reason(code).to_string())
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmq::{Dmq, DmqConfig, FnHandler, InboundMessage, Node, PeerHandler, PeerResponse};
    use tokio::sync::mpsc;

    #[test]
    fn test_socket_target() {
        assert_eq!(socket_target("sip:usrloc@10.0.0.2:5070", 5060).as_deref(), Some("10.0.0.2:5070"));
        assert_eq!(socket_target("sip:usrloc@h1", 5060).as_deref(), Some("h1:5060"));
        assert_eq!(socket_target("sips:p@h2;transport=tls", 5061).as_deref(), Some("h2:5061"));
        assert_eq!(socket_target("sip:p@[::1]:5070", 5060).as_deref(), Some("[::1]:5070"));
        assert_eq!(socket_target("sip:p@[::1]", 5060).as_deref(), Some("[::1]:5060"));
        assert_eq!(socket_target("sip:p@", 5060), None);
        assert_eq!(socket_target("sip:p@h1:notaport", 5060), None);
    }

    #[test]
    fn test_deliver_rejected_without_runtime() {
        let transport = TcpTransport::new(TcpConfig::default());
        let request = OutboundRequest {
            call_id: "c1".to_string(),
            method: DMQ_METHOD.to_string(),
            peer_id: "x".to_string(),
            target: "sip:x@127.0.0.1:1".to_string(),
            from: "sip:a@h0".to_string(),
            headers: vec![],
            body: String::new(),
        };
        let ctx = CompletionContext::new(None, Node::new("sip:127.0.0.1:1"), "c1");

        let err = transport.deliver(request, ctx).unwrap_err();
        assert!(matches!(err, Error::SendRejected { .. }));
    }

    async fn node_with_echo() -> (Arc<Dmq>, SocketAddr) {
        let transport = Arc::new(TcpTransport::new(TcpConfig::default()));
        let dmq = Dmq::new(DmqConfig::new("sip:127.0.0.1:1"), transport).unwrap();
        dmq.register_peer(
            "echo",
            "echo",
            FnHandler::new(|_: &InboundMessage, _: Option<&Node>| Ok(PeerResponse::new(202, "Accepted"))),
        )
        .unwrap();
        dmq.start().await.unwrap();

        let (addr, _task) = serve("127.0.0.1:0".parse().unwrap(), dmq.clone(), TcpConfig::default())
            .await
            .unwrap();
        (dmq, addr)
    }

    async fn send_and_wait(peer_id: &str, address: &str) -> u16 {
        let config = TcpConfig {
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(5),
            ..TcpConfig::default()
        };
        send_with(config, peer_id, address).await
    }

    async fn send_with(config: TcpConfig, peer_id: &str, address: &str) -> u16 {
        let sender = Dmq::new(DmqConfig::new("sip:127.0.0.1:2"), Arc::new(TcpTransport::new(config))).unwrap();
        let peer = sender
            .register_peer(peer_id, "test", FnHandler::new(|_: &InboundMessage, _: Option<&Node>| Ok(PeerResponse::ok())))
            .unwrap_or_else(|_| sender.find_peer(peer_id).unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: Arc<dyn crate::dmq::ResponseCallback> = Arc::new(move |code: u16, _: &Node| {
            let _ = tx.send(code);
        });
        sender.send(&peer, "hi", address, Some(callback), 1, None).unwrap();

        timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_request_reaches_peer() {
        let (dmq, addr) = node_with_echo().await;
        let code = send_and_wait("echo", &format!("sip:{}", addr)).await;
        assert_eq!(code, 202);
        dmq.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_answered_404() {
        let (dmq, addr) = node_with_echo().await;
        let code = send_and_wait("nobody", &format!("sip:{}", addr)).await;
        assert_eq!(code, 404);
        dmq.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_node_completes_503() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let code = send_and_wait("echo", &format!("sip:{}", addr)).await;
        assert_eq!(code, 503);
    }

    struct Stall(Duration);

    #[async_trait::async_trait]
    impl PeerHandler for Stall {
        async fn handle(&self, _: &InboundMessage, _: Option<&Node>) -> Result<PeerResponse> {
            tokio::time::sleep(self.0).await;
            Ok(PeerResponse::ok())
        }
    }

    #[tokio::test]
    async fn test_slow_peer_completes_408() {
        let transport = Arc::new(TcpTransport::new(TcpConfig::default()));
        let dmq = Dmq::new(DmqConfig::new("sip:127.0.0.1:1"), transport).unwrap();
        dmq.register_peer("slow", "stalls", Arc::new(Stall(Duration::from_secs(2)))).unwrap();
        dmq.start().await.unwrap();
        let (addr, _task) = serve("127.0.0.1:0".parse().unwrap(), dmq.clone(), TcpConfig::default())
            .await
            .unwrap();

        let config = TcpConfig {
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_millis(100),
            ..TcpConfig::default()
        };
        let code = send_with(config, "slow", &format!("sip:{}", addr)).await;
        assert_eq!(code, 408);
        dmq.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_dmq_method_answered_400() {
        let (dmq, addr) = node_with_echo().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = OutboundRequest {
            call_id: "invite-1".to_string(),
            method: "INVITE".to_string(),
            peer_id: "echo".to_string(),
            target: format!("sip:echo@{}", addr),
            from: "sip:a@h0".to_string(),
            headers: vec![],
            body: String::new(),
        };
        write_frame(&mut stream, &WireMessage::Request(request), DEFAULT_MAX_FRAME).await.unwrap();

        let reply = timeout(Duration::from_secs(5), read_frame(&mut stream, DEFAULT_MAX_FRAME))
            .await
            .unwrap()
            .unwrap();
        match reply {
            WireMessage::Response { call_id, code, .. } => {
                assert_eq!(call_id, "invite-1");
                assert_eq!(code, 400);
            }
            other => panic!("expected a response, got {:?}", other),
        }
        dmq.shutdown().await;
    }
}
