//! HTTP/1.1 request decoder and response encoder.
//!
//! # Responsibilities
//! - Decode request heads with `httparse`, bodies by `Content-Length` or
//!   chunked transfer coding
//! - Answer malformed framing with `400` (`431` for oversized heads) and close
//! - Encode response heads and body chunks, applying chunk framing when the
//!   head announces `Transfer-Encoding: chunked`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{request, HeaderMap, HeaderValue, Request, Response, StatusCode, Version};

use crate::codec::chunked::{ChunkEvent, ChunkedDecoder};
use crate::codec::CodecError;
use crate::pipeline::{Inbound, Outbound, PipelineError, Stage, StageContext};

const MAX_HEADERS: usize = 128;

#[derive(Debug)]
enum Decode {
    Head,
    Fixed(u64),
    Chunked(ChunkedDecoder),
    Failed,
}

#[derive(Debug)]
enum Framing {
    Length(u64),
    Chunked,
}

/// Stage that frames HTTP/1.1 in both directions.
#[derive(Debug)]
pub struct Http1Codec {
    max_head_size: usize,
    buffer: BytesMut,
    decode: Decode,
    chunked_out: bool,
}

impl Http1Codec {
    pub fn new(max_head_size: usize) -> Self {
        Self {
            max_head_size,
            buffer: BytesMut::new(),
            decode: Decode::Head,
            chunked_out: false,
        }
    }

    fn decode_available(&mut self, ctx: &mut StageContext<'_>) -> Result<(), CodecError> {
        loop {
            match &mut self.decode {
                Decode::Failed => {
                    self.buffer.clear();
                    return Ok(());
                }
                Decode::Head => {
                    // Empty lines before a request line are ignored.
                    while self.buffer.starts_with(b"\r\n") {
                        self.buffer.advance(2);
                    }
                    if self.buffer.is_empty() {
                        return Ok(());
                    }
                    let Some((parts, consumed)) = parse_head(&self.buffer, self.max_head_size)? else {
                        return Ok(());
                    };
                    self.buffer.advance(consumed);
                    let framing = body_framing(&parts.headers)?;
                    tracing::trace!(
                        connection_id = %ctx.connection().id(),
                        method = %parts.method,
                        uri = %parts.uri,
                        ?framing,
                        "Decoded request head"
                    );
                    ctx.fire_inbound(Inbound::Head(Box::new(parts)));
                    match framing {
                        Framing::Length(0) => ctx.fire_inbound(Inbound::End),
                        Framing::Length(n) => self.decode = Decode::Fixed(n),
                        Framing::Chunked => self.decode = Decode::Chunked(ChunkedDecoder::new()),
                    }
                }
                Decode::Fixed(remaining) => {
                    if self.buffer.is_empty() {
                        return Ok(());
                    }
                    let take = (*remaining).min(self.buffer.len() as u64);
                    let chunk = self.buffer.split_to(take as usize).freeze();
                    *remaining -= take;
                    ctx.fire_inbound(Inbound::Body(chunk));
                    if *remaining == 0 {
                        ctx.fire_inbound(Inbound::End);
                        self.decode = Decode::Head;
                    }
                }
                Decode::Chunked(decoder) => match decoder.decode(&mut self.buffer)? {
                    Some(ChunkEvent::Data(chunk)) => ctx.fire_inbound(Inbound::Body(chunk)),
                    Some(ChunkEvent::End) => {
                        ctx.fire_inbound(Inbound::End);
                        self.decode = Decode::Head;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    fn encode_chunk(&self, chunk: Bytes) -> Bytes {
        if !self.chunked_out {
            return chunk;
        }
        let size = format!("{:x}\r\n", chunk.len());
        let mut out = BytesMut::with_capacity(size.len() + chunk.len() + 2);
        out.put_slice(size.as_bytes());
        out.put_slice(&chunk);
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

impl Stage for Http1Codec {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        let data = match msg {
            Inbound::Data(data) => data,
            other => {
                ctx.fire_inbound(other);
                return Ok(());
            }
        };
        self.buffer.extend_from_slice(&data);

        if let Err(err) = self.decode_available(ctx) {
            let status = match err {
                CodecError::HeadTooLarge { .. }
                | CodecError::MalformedHead(httparse::Error::TooManyHeaders) => {
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
                }
                _ => StatusCode::BAD_REQUEST,
            };
            tracing::debug!(
                connection_id = %ctx.connection().id(),
                peer_addr = %ctx.connection().peer_addr(),
                error = %err,
                status = status.as_u16(),
                "Rejecting malformed request"
            );
            self.decode = Decode::Failed;
            self.buffer.clear();
            ctx.fire_outbound(Outbound::Data(encode_response(&error_response(status))));
            ctx.fire_outbound(Outbound::Close);
            return Err(err.into());
        }
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        match msg {
            Outbound::Head(parts) => {
                self.chunked_out = is_chunked(&parts.headers);
                ctx.fire_outbound(Outbound::Data(encode_head(parts.status, &parts.headers)));
            }
            Outbound::Chunk(chunk) => {
                if !chunk.is_empty() {
                    ctx.fire_outbound(Outbound::Data(self.encode_chunk(chunk)));
                }
            }
            Outbound::Last => {
                if self.chunked_out {
                    ctx.fire_outbound(Outbound::Data(Bytes::from_static(b"0\r\n\r\n")));
                    self.chunked_out = false;
                }
            }
            Outbound::Response(response) => {
                ctx.fire_outbound(Outbound::Data(encode_response(&response)));
            }
            other => ctx.fire_outbound(other),
        }
        Ok(())
    }
}

fn parse_head(buf: &[u8], limit: usize) -> Result<Option<(request::Parts, usize)>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let consumed = match req.parse(buf)? {
        httparse::Status::Partial if buf.len() > limit => {
            return Err(CodecError::HeadTooLarge { limit });
        }
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(n) if n > limit => {
            return Err(CodecError::HeadTooLarge { limit });
        }
        httparse::Status::Complete(n) => n,
    };

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(req.method.unwrap_or_default())
        .uri(req.path.unwrap_or_default())
        .version(version);
    for header in req.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let (parts, ()) = builder.body(())?.into_parts();
    Ok(Some((parts, consumed)))
}

fn body_framing(headers: &HeaderMap) -> Result<Framing, CodecError> {
    if headers.contains_key(TRANSFER_ENCODING) {
        if headers.contains_key(CONTENT_LENGTH) {
            return Err(CodecError::ConflictingFraming);
        }
        for value in headers.get_all(TRANSFER_ENCODING) {
            let value = value.to_str().map_err(|_| CodecError::UnsupportedTransferCoding(String::new()))?;
            for coding in value.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if !coding.eq_ignore_ascii_case("chunked") {
                    return Err(CodecError::UnsupportedTransferCoding(coding.to_string()));
                }
            }
        }
        return Ok(Framing::Chunked);
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(CodecError::InvalidContentLength)?;
        if length.is_some_and(|seen| seen != parsed) {
            return Err(CodecError::InvalidContentLength);
        }
        length = Some(parsed);
    }
    Ok(Framing::Length(length.unwrap_or(0)))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|c| c.trim().eq_ignore_ascii_case("chunked")))
}

pub(crate) fn encode_head(status: StatusCode, headers: &HeaderMap) -> Bytes {
    let mut out = BytesMut::with_capacity(128 + headers.len() * 32);
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(status.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.put_slice(b"\r\n");
    for (name, value) in headers {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.freeze()
}

/// Encodes a complete response with a `Content-Length` body.
pub fn encode_response(response: &Response<Bytes>) -> Bytes {
    let mut headers = response.headers().clone();
    headers.remove(TRANSFER_ENCODING);
    if !headers.contains_key(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(response.body().len()));
    }
    let head = encode_head(response.status(), &headers);
    let mut out = BytesMut::with_capacity(head.len() + response.body().len());
    out.put_slice(&head);
    out.put_slice(response.body());
    out.freeze()
}

/// Empty response that also asks for the connection to be closed.
pub fn error_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
