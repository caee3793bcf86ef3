//! Response compression driven by `Accept-Encoding`.
//!
//! # Responsibilities
//! - Negotiate a content coding per request (identity, gzip, x-gzip, deflate)
//! - Compress eligible response bodies with `flate2`
//! - Answer `406 Not Acceptable` when the client rules out every coding
//!
//! # Negotiation rules
//! - No `Accept-Encoding` header: identity
//! - `*` stands for every coding not listed explicitly
//! - identity stays acceptable unless listed with `q=0`, or `*;q=0` is given
//!   without an explicit identity entry
//! - equal weights go to the configured preferred coding

use std::collections::VecDeque;
use std::io::Write;

use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use http::{HeaderValue, Response, StatusCode};

use crate::config::schema::{CompressionOptions, PreferredCoding};
use crate::pipeline::{Inbound, Outbound, PipelineError, Stage, StageContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    /// Same encoding as gzip, echoed under the name the client asked for.
    XGzip,
    Deflate,
}

impl ContentCoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCoding::Identity => "identity",
            ContentCoding::Gzip => "gzip",
            ContentCoding::XGzip => "x-gzip",
            ContentCoding::Deflate => "deflate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionDecision {
    Use(ContentCoding),
    NotAcceptable,
}

#[derive(Debug, Default)]
struct Weights {
    entries: Vec<(String, f32)>,
}

impl Weights {
    fn parse(header: &str) -> Self {
        let entries = header
            .split(',')
            .filter_map(|item| {
                let mut params = item.split(';').map(str::trim);
                let coding = params.next().filter(|c| !c.is_empty())?.to_ascii_lowercase();
                let q = params
                    .filter_map(|p| p.strip_prefix("q=").or_else(|| p.strip_prefix("Q=")))
                    .next()
                    .map(|q| q.parse::<f32>().unwrap_or(0.0).clamp(0.0, 1.0))
                    .unwrap_or(1.0);
                Some((coding, q))
            })
            .collect();
        Self { entries }
    }

    fn explicit(&self, coding: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(name, _)| name == coding)
            .map(|(_, q)| *q)
    }

    fn of(&self, coding: &str) -> f32 {
        self.explicit(coding)
            .or_else(|| self.explicit("*"))
            .unwrap_or(0.0)
    }

    fn identity(&self) -> f32 {
        match (self.explicit("identity"), self.explicit("*")) {
            (Some(q), _) => q,
            (None, Some(q)) if q == 0.0 => 0.0,
            // Acceptable, below any coding the client asked for.
            _ => f32::MIN_POSITIVE,
        }
    }
}

/// Picks the coding for a response to a request with the given
/// `Accept-Encoding` value.
pub fn negotiate(accept: Option<&str>, preferred: PreferredCoding) -> CompressionDecision {
    let Some(accept) = accept else {
        return CompressionDecision::Use(ContentCoding::Identity);
    };
    let weights = Weights::parse(accept);

    let gzip = match (weights.explicit("gzip"), weights.explicit("x-gzip")) {
        (Some(q), _) => (ContentCoding::Gzip, q),
        (None, Some(q)) => (ContentCoding::XGzip, q),
        (None, None) => (ContentCoding::Gzip, weights.of("gzip")),
    };
    let deflate = (ContentCoding::Deflate, weights.of("deflate"));
    let candidates = match preferred {
        PreferredCoding::Gzip => [gzip, deflate],
        PreferredCoding::Deflate => [deflate, gzip],
    };

    let mut best = (ContentCoding::Identity, weights.identity());
    for (coding, q) in candidates {
        if q > 0.0 && q > best.1 {
            best = (coding, q);
        }
    }

    if best.1 > 0.0 {
        CompressionDecision::Use(best.0)
    } else {
        CompressionDecision::NotAcceptable
    }
}

fn encode(coding: ContentCoding, level: u32, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let level = Compression::new(level.min(9));
    match coding {
        ContentCoding::Gzip | ContentCoding::XGzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), level);
            encoder.write_all(body)?;
            encoder.finish()
        }
        ContentCoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), level);
            encoder.write_all(body)?;
            encoder.finish()
        }
        ContentCoding::Identity => Ok(body.to_vec()),
    }
}

/// Compresses HTTP/1.1 responses.
#[derive(Debug)]
pub struct CompressionStage {
    options: Option<CompressionOptions>,
    accepts: VecDeque<Option<String>>,
}

impl CompressionStage {
    /// `None` disables the stage; it then only forwards.
    pub fn new(options: Option<CompressionOptions>) -> Self {
        Self {
            options: options.filter(|o| o.enabled),
            accepts: VecDeque::new(),
        }
    }

    fn eligible(options: &CompressionOptions, response: &Response<Bytes>) -> bool {
        let status = response.status();
        if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || response.headers().contains_key(CONTENT_ENCODING)
            || response.body().is_empty()
            || response.body().len() < options.min_size
        {
            return false;
        }
        if options.types.is_empty() {
            return true;
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        options
            .types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}

impl Stage for CompressionStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        if let (Some(_), Inbound::Head(parts)) = (&self.options, &msg) {
            let accept = parts
                .headers
                .get_all(ACCEPT_ENCODING)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>();
            self.accepts
                .push_back((!accept.is_empty()).then(|| accept.join(",")));
        }
        ctx.fire_inbound(msg);
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        let (options, mut response) = match (&self.options, msg) {
            (Some(options), Outbound::Response(response)) => (options, response),
            (_, other) => {
                ctx.fire_outbound(other);
                return Ok(());
            }
        };
        let accept = self.accepts.pop_front().flatten();

        let coding = match negotiate(accept.as_deref(), options.preferred) {
            CompressionDecision::NotAcceptable => {
                tracing::debug!(
                    connection_id = %ctx.connection().id(),
                    accept_encoding = accept.as_deref().unwrap_or(""),
                    "No acceptable content coding"
                );
                let mut refused = Response::new(Bytes::new());
                *refused.status_mut() = StatusCode::NOT_ACCEPTABLE;
                ctx.fire_outbound(Outbound::Response(refused));
                return Ok(());
            }
            CompressionDecision::Use(coding) => coding,
        };

        if coding != ContentCoding::Identity && Self::eligible(options, &response) {
            match encode(coding, options.level, response.body()) {
                Ok(encoded) => {
                    let headers = response.headers_mut();
                    headers.insert(CONTENT_ENCODING, HeaderValue::from_static(coding.as_str()));
                    headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(encoded.len()));
                    *response.body_mut() = Bytes::from(encoded);
                }
                Err(e) => tracing::warn!(
                    connection_id = %ctx.connection().id(),
                    error = %e,
                    "Compression failed, sending identity"
                ),
            }
        }
        ctx.fire_outbound(Outbound::Response(response));
        Ok(())
    }
}
