//! Collects a request head and its body pieces into one [`Request`].

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, EXPECT};
use http::{request, Request, StatusCode};

use crate::codec::http1::error_response;
use crate::pipeline::{Inbound, Outbound, PipelineError, Stage, StageContext};

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug)]
enum State {
    Idle,
    Collecting { parts: Box<request::Parts>, body: BytesMut },
    /// Over the limit; input is ignored until the next head.
    Rejected,
}

/// Bounded request aggregator. A limit of -1 is unbounded.
#[derive(Debug)]
pub struct Aggregator {
    limit: Option<u64>,
    state: State,
}

impl Aggregator {
    pub fn new(message_size_limit: i64) -> Self {
        Self {
            limit: u64::try_from(message_size_limit).ok(),
            state: State::Idle,
        }
    }

    fn exceeds(&self, size: u64) -> bool {
        self.limit.is_some_and(|limit| size > limit)
    }

    fn reject(&mut self, ctx: &mut StageContext<'_>, size: u64) {
        tracing::debug!(
            connection_id = %ctx.connection().id(),
            size,
            limit = self.limit,
            "Request body over the message size limit"
        );
        self.state = State::Rejected;
        ctx.fire_outbound(Outbound::Response(error_response(StatusCode::PAYLOAD_TOO_LARGE)));
    }
}

fn declared_length(parts: &request::Parts) -> Option<u64> {
    parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn expects_continue(parts: &request::Parts) -> bool {
    parts
        .headers
        .get(EXPECT)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}

impl Stage for Aggregator {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        match msg {
            Inbound::Head(parts) => {
                if let Some(declared) = declared_length(&parts).filter(|&n| self.exceeds(n)) {
                    self.reject(ctx, declared);
                    return Ok(());
                }
                if expects_continue(&parts) {
                    ctx.fire_outbound(Outbound::Data(Bytes::from_static(CONTINUE)));
                }
                self.state = State::Collecting {
                    parts,
                    body: BytesMut::new(),
                };
            }
            Inbound::Body(chunk) => {
                let size = match &mut self.state {
                    State::Collecting { body, .. } => {
                        body.extend_from_slice(&chunk);
                        body.len() as u64
                    }
                    State::Rejected => return Ok(()),
                    State::Idle => {
                        return Err(PipelineError::Unexpected {
                            stage: ctx.name(),
                            message: "body without a request head".to_string(),
                        })
                    }
                };
                if self.exceeds(size) {
                    self.reject(ctx, size);
                }
            }
            Inbound::End => match std::mem::replace(&mut self.state, State::Idle) {
                State::Collecting { parts, body } => {
                    ctx.fire_inbound(Inbound::Request(Request::from_parts(*parts, body.freeze())));
                }
                State::Rejected | State::Idle => {}
            },
            other => ctx.fire_inbound(other),
        }
        Ok(())
    }
}
