//! Per-connection I/O loop around a [`Pipeline`].
//!
//! # Responsibilities
//! - Read the socket into the chain and write produced frames back
//! - Hand queued requests to the [`Dispatcher`](crate::http::Dispatcher) one at a
//!   time, in order, and write each response before the next dispatch
//! - Pump HTTP/2 bytes from the bridge task to the socket
//! - Close on end-of-stream frames, stage errors, EOF and shutdown

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

use crate::pipeline::{names, Assembler, Outbound, Pipeline, PipelineError, PipelineEvent};

const READ_BUFFER: usize = 16 * 1024;

#[derive(Debug)]
enum Step {
    Read(io::Result<usize>),
    H2(Option<Bytes>),
    Shutdown,
}

/// Whether the connection keeps going after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Closed,
}

pub struct ConnectionDriver<S> {
    stream: S,
    pipeline: Pipeline,
    assembler: Arc<Assembler>,
    shutdown: broadcast::Receiver<()>,
}

impl<S> ConnectionDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, pipeline: Pipeline, assembler: Arc<Assembler>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            stream,
            pipeline,
            assembler,
            shutdown,
        }
    }

    pub async fn run(mut self) -> io::Result<()> {
        let id = self.pipeline.connection().id();
        let mut buf = BytesMut::with_capacity(READ_BUFFER);

        loop {
            buf.reserve(READ_BUFFER);
            let step = {
                let Self {
                    stream,
                    pipeline,
                    shutdown,
                    ..
                } = &mut self;
                tokio::select! {
                    read = stream.read_buf(&mut buf) => Step::Read(read),
                    bytes = h2_outbound(pipeline) => Step::H2(bytes),
                    _ = shutdown.recv() => Step::Shutdown,
                }
            };

            let flow = match step {
                Step::Read(Ok(0)) => self.read_closed().await?,
                Step::Read(Ok(_)) => {
                    let result = self.pipeline.read(buf.split());
                    self.after(result).await?
                }
                Step::Read(Err(e)) => {
                    tracing::debug!(connection_id = %id, error = %e, "Socket read failed");
                    Flow::Closed
                }
                Step::H2(Some(bytes)) => {
                    let result = self.pipeline.write_from(names::H2_BRIDGE, Outbound::Data(bytes));
                    self.after(result).await?
                }
                Step::H2(None) => {
                    tracing::debug!(connection_id = %id, "HTTP/2 session finished");
                    self.pipeline.connection_mut().detach_h2_outbound();
                    self.close().await?
                }
                Step::Shutdown => {
                    tracing::debug!(connection_id = %id, "Closing connection for shutdown");
                    self.close().await?
                }
            };

            if flow == Flow::Closed {
                break;
            }
        }

        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(connection_id = %id, error = %e, "Socket shutdown failed");
        }
        Ok(())
    }

    async fn read_closed(&mut self) -> io::Result<Flow> {
        let half_closure = self.pipeline.connection().half_closure_allowed();
        tracing::trace!(
            connection_id = %self.pipeline.connection().id(),
            half_closure,
            "Peer closed its write side"
        );
        let result = self.pipeline.fire_event(PipelineEvent::ReadClosed);
        if half_closure {
            // Requests already received are still answered.
            if self.after(result).await? == Flow::Closed {
                return Ok(Flow::Closed);
            }
        } else if let Err(err) = result {
            self.report(&err);
        }
        self.close().await
    }

    /// Writes what the chain produced, then serves queued requests in order.
    async fn after(&mut self, result: Result<(), PipelineError>) -> io::Result<Flow> {
        if let Err(err) = result {
            self.report(&err);
            self.flush().await?;
            return Ok(Flow::Closed);
        }

        loop {
            if self.flush().await? == Flow::Closed {
                return Ok(Flow::Closed);
            }
            let Some(request) = self.pipeline.next_dispatch() else {
                return Ok(Flow::Continue);
            };
            let response = self.assembler.dispatcher().dispatch(request).await;
            if let Err(err) = self.pipeline.respond(response) {
                self.report(&err);
                self.flush().await?;
                return Ok(Flow::Closed);
            }
        }
    }

    /// Sends a close through the chain (TLS close_notify included).
    async fn close(&mut self) -> io::Result<Flow> {
        if let Err(err) = self.pipeline.write_from(names::DISPATCHER, Outbound::Close) {
            self.report(&err);
        }
        self.flush().await?;
        Ok(Flow::Closed)
    }

    async fn flush(&mut self) -> io::Result<Flow> {
        let mut flow = Flow::Continue;
        for frame in self.pipeline.take_frames() {
            if frame.is_end_of_stream() {
                flow = Flow::Closed;
                break;
            }
            self.stream.write_all(frame.payload()).await?;
        }
        self.stream.flush().await?;

        let entries = self.pipeline.take_access_entries();
        if let Some(sink) = self.assembler.access_log() {
            for entry in &entries {
                sink.log(entry);
            }
        }
        Ok(flow)
    }

    fn report(&self, err: &PipelineError) {
        let conn = self.pipeline.connection();
        match err {
            PipelineError::Codec(_) => {
                tracing::debug!(connection_id = %conn.id(), peer_addr = %conn.peer_addr(), error = %err, "Closing connection after a framing error");
            }
            // Already reported through the handshake limiter.
            PipelineError::Tls(_) => {
                tracing::trace!(connection_id = %conn.id(), error = %err, "Closing connection after a TLS error");
            }
            _ => {
                tracing::warn!(connection_id = %conn.id(), peer_addr = %conn.peer_addr(), error = %err, "Closing connection after a pipeline error");
            }
        }
    }
}

async fn h2_outbound(pipeline: &mut Pipeline) -> Option<Bytes> {
    match pipeline.connection_mut().h2_outbound_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
