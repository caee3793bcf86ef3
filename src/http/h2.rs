//! HTTP/2 bridge.
//!
//! # Data Flow
//! ```text
//! chain Data ──► inbound channel ──► pump ──► duplex ──► hyper http2 server
//!                                                          │
//!                                                          ▼
//!                                                     Dispatcher
//!                                                          │
//! driver ◄── ConnectionContext::h2_outbound ◄── pump ◄── duplex
//! driver ──► Pipeline::write_from(h2-bridge, Data) ──► TLS / buffer bridge
//! ```
//!
//! # Design Decisions
//! - The frame layer is hyper's; the chain only carries bytes
//! - The server task starts on the first byte, so building the chain never
//!   spawns
//! - Access entries are logged when the response is handed to hyper
//! - After an `h2c` upgrade the request frames are spliced in behind the
//!   client's first frame (see [`UpgradeSeed`])

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::http::dispatch::Dispatcher;
use crate::http::forwarded::resolve;
use crate::http::h2c::UpgradeSeed;
use crate::net::connection::ConnectionId;
use crate::observability::access::{client_address, entry};
use crate::observability::{metrics, AccessLogSink};
use crate::pipeline::{ConnectionInfo, Inbound, PipelineError, PipelineEvent, Stage, StageContext};
use crate::security::TrustedProxies;

const DUPLEX_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Everything an HTTP/2 connection needs from the assembler.
#[derive(Clone)]
pub struct H2Settings {
    pub dispatcher: Arc<dyn Dispatcher>,
    /// `None` when access logging is disabled.
    pub access_log: Option<Arc<dyn AccessLogSink>>,
    /// `None` when forwarded headers are ignored.
    pub proxies: Option<Arc<TrustedProxies>>,
    pub forwarded_in_access_log: bool,
}

impl std::fmt::Debug for H2Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Settings")
            .field("access_log", &self.access_log.is_some())
            .field("proxies", &self.proxies)
            .field("forwarded_in_access_log", &self.forwarded_in_access_log)
            .finish()
    }
}

/// Terminal protocol stage of HTTP/2 chains.
#[derive(Debug)]
pub struct H2Bridge {
    settings: H2Settings,
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    started: bool,
    seed: Option<UpgradeSeed>,
}

impl H2Bridge {
    pub fn new(settings: H2Settings) -> Self {
        Self {
            settings,
            inbound: None,
            started: false,
            seed: None,
        }
    }

    /// Bridge for a connection upgraded from HTTP/1.1. `frames` replay the
    /// upgrade request on stream 1.
    pub fn with_upgrade(mut self, frames: Bytes) -> Self {
        self.seed = Some(UpgradeSeed::new(frames));
        self
    }

    fn start(&mut self, ctx: &mut StageContext<'_>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        ctx.connection_mut().attach_h2_outbound(out_rx);

        let info = ctx.connection().info();
        let id = info.id;
        let (server_io, pump_io) = tokio::io::duplex(DUPLEX_BUFFER);
        tokio::spawn(pump(pump_io, in_rx, out_tx, id));

        let settings = self.settings.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(settings.clone(), info.clone(), req));
            if let Err(e) = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(server_io), service)
                .await
            {
                tracing::debug!(connection_id = %id, error = %e, "HTTP/2 connection ended with an error");
            }
        });

        tracing::debug!(connection_id = %id, protocol = %ctx.connection().info().protocol, "HTTP/2 server started");
        self.inbound = Some(in_tx);
        self.started = true;
    }
}

impl Stage for H2Bridge {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        match msg {
            Inbound::Data(bytes) => {
                let bytes = match self.seed.as_mut() {
                    Some(seed) => match seed.push(&bytes) {
                        Some(ready) => {
                            self.seed = None;
                            ready
                        }
                        None => return Ok(()),
                    },
                    None => bytes,
                };
                if !self.started {
                    self.start(ctx);
                }
                let delivered = self
                    .inbound
                    .as_ref()
                    .is_some_and(|tx| tx.send(bytes).is_ok());
                if !delivered {
                    tracing::debug!(connection_id = %ctx.connection().id(), "HTTP/2 server no longer reading");
                }
            }
            Inbound::Event(PipelineEvent::ReadClosed) => {
                self.inbound = None;
                self.seed = None;
                ctx.fire_inbound(msg);
            }
            Inbound::Event(_) => ctx.fire_inbound(msg),
            other => {
                return Err(PipelineError::Unexpected {
                    stage: ctx.name(),
                    message: format!("{} on an HTTP/2 connection", other.kind()),
                })
            }
        }
        Ok(())
    }
}

/// Moves bytes between the chain channels and hyper's side of the duplex.
async fn pump(
    io: DuplexStream,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    id: ConnectionId,
) {
    let (mut reader, mut writer) = tokio::io::split(io);

    let write_side = async move {
        while let Some(bytes) = inbound.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(connection_id = %id, error = %e, "HTTP/2 duplex shutdown failed");
        }
    };

    let read_side = async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if outbound.send(buf.split().freeze()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(connection_id = %id, error = %e, "HTTP/2 duplex read failed");
                    break;
                }
            }
        }
    };

    tokio::join!(write_side, read_side);
}

async fn handle(
    settings: H2Settings,
    info: ConnectionInfo,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let mut request = Request::from_parts(parts, body);

    let forwarded = settings
        .proxies
        .as_deref()
        .and_then(|proxies| resolve(request.headers(), info.peer_addr.ip(), proxies));
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();
    if let Some(chain) = &forwarded {
        request.extensions_mut().insert(chain.clone());
    }
    request.extensions_mut().insert(info.clone());

    let response = settings.dispatcher.dispatch(request).await;
    let status = response.status().as_u16();
    metrics::record_request(info.protocol.as_str(), status);

    if let Some(sink) = &settings.access_log {
        let client = client_address(info.peer_addr, forwarded.as_ref(), settings.forwarded_in_access_log);
        sink.log(&entry(
            &method,
            &uri,
            version,
            status,
            info.protocol,
            client,
            response.body().len() as u64,
            started,
        ));
    }

    Ok(response.map(Full::new))
}
