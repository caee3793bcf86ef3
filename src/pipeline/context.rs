//! Per-connection state shared by every stage of one chain.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::net::connection::ConnectionId;
use crate::security::forwarded::ForwardedChain;

/// Protocol a connection ended up speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1 over a plain socket.
    Plaintext11,
    /// HTTP/1.1 inside TLS.
    Tls11,
    /// HTTP/2 negotiated through ALPN.
    H2,
    /// HTTP/2 over cleartext (prior knowledge).
    H2c,
}

impl Protocol {
    /// Name reported in access logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Plaintext11 | Protocol::Tls11 => "HTTP/1.1",
            Protocol::H2 => "h2",
            Protocol::H2c => "h2c",
        }
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, Protocol::H2 | Protocol::H2c)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection metadata handed to the dispatcher as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub protocol: Protocol,
    pub secure: bool,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Strongly typed attribute bag for one accepted socket.
///
/// The driver owns it; stages reach it through
/// [`StageContext::connection`](crate::pipeline::StageContext::connection).
#[derive(Debug)]
pub struct ConnectionContext {
    id: ConnectionId,
    secure: bool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    protocol: Option<Protocol>,
    alpn: Option<Vec<u8>>,
    started_at: Option<Instant>,
    half_closure: bool,
    forwarded: Option<ForwardedChain>,
    h2_outbound: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, secure: bool, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            secure,
            local_addr,
            peer_addr,
            protocol: None,
            alpn: None,
            started_at: None,
            half_closure: false,
            forwarded: None,
            h2_outbound: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Negotiated protocol, `None` while TLS or h2c detection is pending.
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        tracing::debug!(connection_id = %self.id, protocol = %protocol, "Protocol decided");
        self.protocol = Some(protocol);
    }

    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn set_alpn(&mut self, alpn: Option<Vec<u8>>) {
        self.alpn = alpn;
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Records the start instant; later calls are ignored.
    pub fn mark_started(&mut self, now: Instant) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(now);
        true
    }

    pub fn half_closure_allowed(&self) -> bool {
        self.half_closure
    }

    pub fn enable_half_closure(&mut self) {
        self.half_closure = true;
    }

    pub fn disable_half_closure(&mut self) {
        self.half_closure = false;
    }

    /// Forwarded data of the request currently being dispatched.
    pub fn forwarded(&self) -> Option<&ForwardedChain> {
        self.forwarded.as_ref()
    }

    pub fn set_forwarded(&mut self, forwarded: Option<ForwardedChain>) {
        self.forwarded = forwarded;
    }

    pub fn take_forwarded(&mut self) -> Option<ForwardedChain> {
        self.forwarded.take()
    }

    /// Snapshot handed to the dispatcher. Falls back to plaintext HTTP/1.1
    /// when no protocol was recorded yet.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            protocol: self.protocol.unwrap_or(if self.secure {
                Protocol::Tls11
            } else {
                Protocol::Plaintext11
            }),
            secure: self.secure,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
        }
    }

    /// Attaches the byte stream produced by the HTTP/2 server task.
    pub fn attach_h2_outbound(&mut self, rx: mpsc::UnboundedReceiver<Bytes>) {
        self.h2_outbound = Some(rx);
    }

    pub fn h2_outbound_mut(&mut self) -> Option<&mut mpsc::UnboundedReceiver<Bytes>> {
        self.h2_outbound.as_mut()
    }

    pub fn detach_h2_outbound(&mut self) {
        self.h2_outbound = None;
    }
}
