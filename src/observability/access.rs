//! Access logging and outbound diagnostics.
//!
//! # Responsibilities
//! - Stamp the connection start instant on the first inbound message
//! - Produce one [`AccessLogEntry`] per completed response
//! - Trace outbound chunk sizes
//!
//! # Design Decisions
//! - Entries are queued on the pipeline output; the driver hands them to the
//!   sink only after the response bytes were written
//! - The sink is a trait so deployments choose the format and destination

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use http::{Method, Uri, Version};
use serde::Serialize;

use crate::observability::metrics;
use crate::pipeline::{Inbound, Outbound, PipelineError, Protocol, Stage, StageContext};
use crate::security::ForwardedChain;

/// One completed request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessLogEntry {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub status: u16,
    pub protocol: &'static str,
    pub client: String,
    pub bytes_written: u64,
    pub elapsed_ms: f64,
}

/// Destination of access log entries.
pub trait AccessLogSink: Send + Sync {
    fn log(&self, entry: &AccessLogEntry);
}

/// Writes entries as JSON through `tracing` under the `conduit::access` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLogSink for TracingAccessLog {
    fn log(&self, entry: &AccessLogEntry) {
        match serde_json::to_string(entry) {
            Ok(line) => tracing::info!(target: "conduit::access", "{}", line),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize access log entry"),
        }
    }
}

#[derive(Debug)]
struct Pending {
    method: Method,
    uri: Uri,
    version: Version,
    started: Instant,
}

/// Client address for an entry: the forwarded client when allowed and
/// present, the socket peer otherwise.
pub fn client_address(peer: SocketAddr, forwarded: Option<&ForwardedChain>, use_forwarded: bool) -> String {
    forwarded
        .filter(|_| use_forwarded)
        .and_then(ForwardedChain::client)
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Builds an entry for an exchange handled outside the stage chain.
#[allow(clippy::too_many_arguments)]
pub fn entry(
    method: &Method,
    uri: &Uri,
    version: Version,
    status: u16,
    protocol: Protocol,
    client: String,
    bytes_written: u64,
    started: Instant,
) -> AccessLogEntry {
    AccessLogEntry {
        method: method.to_string(),
        uri: uri.to_string(),
        version: format!("{:?}", version),
        status,
        protocol: protocol.as_str(),
        client,
        bytes_written,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}

/// Records start times and emits access entries for HTTP/1.1 exchanges.
#[derive(Debug)]
pub struct AccessStage {
    use_forwarded: bool,
    pending: VecDeque<Pending>,
}

impl AccessStage {
    pub fn new(use_forwarded: bool) -> Self {
        Self {
            use_forwarded,
            pending: VecDeque::new(),
        }
    }
}

impl Stage for AccessStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        let now = Instant::now();
        ctx.connection_mut().mark_started(now);
        if let Inbound::Head(parts) = &msg {
            self.pending.push_back(Pending {
                method: parts.method.clone(),
                uri: parts.uri.clone(),
                version: parts.version,
                started: now,
            });
        }
        ctx.fire_inbound(msg);
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        let Outbound::Response(response) = msg else {
            ctx.fire_outbound(msg);
            return Ok(());
        };

        let conn = ctx.connection();
        let protocol = conn.info().protocol;
        let client = client_address(
            conn.peer_addr(),
            response.extensions().get::<ForwardedChain>(),
            self.use_forwarded,
        );
        let status = response.status().as_u16();
        let bytes_written = response.body().len() as u64;
        let pending = self.pending.pop_front();

        // The write goes first; the entry is only queued.
        ctx.fire_outbound(Outbound::Response(response));

        metrics::record_request(protocol.as_str(), status);
        match pending {
            Some(p) => ctx.log_access(entry(
                &p.method,
                &p.uri,
                p.version,
                status,
                protocol,
                client,
                bytes_written,
                p.started,
            )),
            None => tracing::debug!(
                connection_id = %ctx.connection().id(),
                status,
                "Response without a recorded request"
            ),
        }
        Ok(())
    }
}

/// Traces the size of every outbound chunk.
#[derive(Debug, Default)]
pub struct ChunkLoggingStage;

impl Stage for ChunkLoggingStage {
    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        if let Outbound::Chunk(chunk) = &msg {
            tracing::trace!(connection_id = %ctx.connection().id(), chunk_len = chunk.len(), "Writing chunk");
        }
        ctx.fire_outbound(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use crate::pipeline::{names, ConnectionContext, NamedStage, Pipeline, StageChain};
    use bytes::Bytes;
    use http::{Request, Response};

    struct Terminal;

    impl Stage for Terminal {}

    fn pipeline(use_forwarded: bool) -> Pipeline {
        let mut chain = StageChain::new();
        chain
            .add_last(NamedStage::new(names::ACCESS_LOG, AccessStage::new(use_forwarded)))
            .unwrap();
        chain
            .add_last(NamedStage::new(names::DISPATCHER, Terminal))
            .unwrap();
        let conn = ConnectionContext::new(
            ConnectionId::new(),
            false,
            "127.0.0.1:80".parse().unwrap(),
            "192.0.2.10:9000".parse().unwrap(),
        );
        Pipeline::new(chain, conn)
    }

    fn head(uri: &str) -> Inbound {
        let (parts, ()) = Request::get(uri).body(()).unwrap().into_parts();
        Inbound::Head(Box::new(parts))
    }

    #[test]
    fn start_time_is_recorded_once() {
        let mut p = pipeline(false);
        assert!(p.connection().started_at().is_none());
        p.fire_event(crate::pipeline::PipelineEvent::ReadClosed).unwrap();
        let first = p.connection().started_at().unwrap();
        p.fire_event(crate::pipeline::PipelineEvent::ReadClosed).unwrap();
        assert_eq!(p.connection().started_at(), Some(first));
    }

    #[test]
    fn response_is_written_before_entry_is_queued() {
        let mut p = pipeline(false);
        p.inject(head("/index.html")).unwrap();
        let response = Response::new(Bytes::from_static(b"hello"));
        p.respond(response).unwrap();

        let entries = p.take_access_entries();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.method, "GET");
        assert_eq!(e.uri, "/index.html");
        assert_eq!(e.status, 200);
        assert_eq!(e.protocol, "HTTP/1.1");
        assert_eq!(e.client, "192.0.2.10");
        assert_eq!(e.bytes_written, 5);
    }

    #[test]
    fn forwarded_client_is_used_when_enabled() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        let chain = crate::security::forwarded::parse(&headers).unwrap().unwrap();

        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(client_address(peer, Some(&chain), true), "198.51.100.1");
        assert_eq!(client_address(peer, Some(&chain), false), "10.0.0.1");
        assert_eq!(client_address(peer, None, true), "10.0.0.1");
    }
}
