//! Splits complete responses into head, body chunks and terminator.

use std::collections::VecDeque;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderValue, Method, Response, StatusCode, Version};

use crate::pipeline::{Inbound, Outbound, PipelineError, Stage, StageContext};

#[derive(Debug, Clone)]
struct RequestSummary {
    method: Method,
    version: Version,
}

/// Writes bodies up to `chunk_size` with `Content-Length`, larger ones with
/// chunked transfer coding (HTTP/1.1 requests only).
#[derive(Debug)]
pub struct ChunkedWriteStage {
    chunk_size: usize,
    requests: VecDeque<RequestSummary>,
}

impl ChunkedWriteStage {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            requests: VecDeque::new(),
        }
    }

    fn write(&self, ctx: &mut StageContext<'_>, response: Response<Bytes>, request: Option<RequestSummary>) {
        let (mut parts, body) = response.into_parts();
        let status = parts.status;
        let bodyless = status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED;
        let head_only = request.as_ref().is_some_and(|r| r.method == Method::HEAD);
        let http10 = request.as_ref().is_some_and(|r| r.version == Version::HTTP_10);

        let chunked = !bodyless
            && !http10
            && !head_only
            && !parts.headers.contains_key(CONTENT_LENGTH)
            && body.len() > self.chunk_size;

        parts.headers.remove(TRANSFER_ENCODING);
        if chunked {
            parts
                .headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        } else if bodyless {
            parts.headers.remove(CONTENT_LENGTH);
        } else if !parts.headers.contains_key(CONTENT_LENGTH) {
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }

        ctx.fire_outbound(Outbound::Head(Box::new(parts)));
        if !bodyless && !head_only {
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + self.chunk_size).min(body.len());
                ctx.fire_outbound(Outbound::Chunk(body.slice(offset..end)));
                offset = end;
            }
        }
        ctx.fire_outbound(Outbound::Last);
    }
}

impl Stage for ChunkedWriteStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        if let Inbound::Head(parts) = &msg {
            self.requests.push_back(RequestSummary {
                method: parts.method.clone(),
                version: parts.version,
            });
        }
        ctx.fire_inbound(msg);
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        match msg {
            Outbound::Response(response) => {
                let request = self.requests.pop_front();
                self.write(ctx, response, request);
            }
            other => ctx.fire_outbound(other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bridge::BufferBridge;
    use crate::codec::http1::Http1Codec;
    use crate::net::connection::ConnectionId;
    use crate::pipeline::{names, ConnectionContext, NamedStage, Pipeline, StageChain};
    use bytes::BytesMut;

    struct Terminal;

    impl Stage for Terminal {}

    fn pipeline(chunk_size: usize) -> Pipeline {
        let mut chain = StageChain::new();
        chain.add_last(NamedStage::new(names::BUFFER_BRIDGE, BufferBridge)).unwrap();
        chain.add_last(NamedStage::new(names::HTTP_CODEC, Http1Codec::new(4096))).unwrap();
        chain
            .add_last(NamedStage::new(names::CHUNKED_WRITE, ChunkedWriteStage::new(chunk_size)))
            .unwrap();
        chain.add_last(NamedStage::new(names::DISPATCHER, Terminal)).unwrap();
        let conn = ConnectionContext::new(
            ConnectionId::new(),
            false,
            "127.0.0.1:80".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
        );
        Pipeline::new(chain, conn)
    }

    fn exchange(p: &mut Pipeline, request: &str, body: &'static [u8]) -> String {
        p.read(BytesMut::from(request)).unwrap();
        p.respond(Response::new(Bytes::from_static(body))).unwrap();
        p.take_frames()
            .into_iter()
            .map(|f| String::from_utf8_lossy(f.payload()).into_owned())
            .collect()
    }

    #[test]
    fn small_bodies_use_content_length() {
        let mut p = pipeline(16);
        let out = exchange(&mut p, "GET / HTTP/1.1\r\nHost: x\r\n\r\n", b"hello");
        assert_eq!(out, "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello");
    }

    #[test]
    fn large_bodies_are_chunked() {
        let mut p = pipeline(4);
        let out = exchange(&mut p, "GET / HTTP/1.1\r\nHost: x\r\n\r\n", b"abcdefghij");
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn http10_and_head_requests() {
        let mut p = pipeline(4);
        let out = exchange(&mut p, "GET / HTTP/1.0\r\n\r\n", b"abcdefghij");
        assert!(out.contains("content-length: 10\r\n"));
        assert!(out.ends_with("abcdefghij"));

        let mut p = pipeline(4);
        let out = exchange(&mut p, "HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", b"abc");
        assert_eq!(out, "HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\n");
    }

    #[test]
    fn head_with_a_large_body_keeps_the_next_response_aligned() {
        let mut p = pipeline(4);
        p.read(BytesMut::from(
            "HEAD /big HTTP/1.1\r\nHost: x\r\n\r\nGET /after HTTP/1.1\r\nHost: x\r\n\r\n",
        ))
        .unwrap();
        p.respond(Response::new(Bytes::from_static(b"abcdefghij"))).unwrap();
        p.respond(Response::new(Bytes::from_static(b"ok"))).unwrap();
        let out: String = p
            .take_frames()
            .into_iter()
            .map(|f| String::from_utf8_lossy(f.payload()).into_owned())
            .collect();
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok"
        );
    }
}
