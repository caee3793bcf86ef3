//! Request normalization ahead of dispatch.
//!
//! - absolute-form targets are rewritten to origin-form, keeping the authority
//!   in `Host`
//! - HTTP/1.1 requests without `Host` are refused with `400`
//! - `Upgrade: h2c` offers that reach this stage are declined and their
//!   headers stripped

use http::header::{HOST, UPGRADE};
use http::uri::PathAndQuery;
use http::{HeaderValue, Request, StatusCode, Uri, Version};

use bytes::Bytes;

use crate::codec::http1::error_response;
use crate::http::h2c::{offers_h2c, HTTP2_SETTINGS};
use crate::pipeline::{Inbound, Outbound, PipelineError, Stage, StageContext};

#[derive(Debug, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }
}

/// Rewrites the request in place. Returns the status to answer with when the
/// request cannot be served.
fn normalize(request: &mut Request<Bytes>) -> Result<bool, StatusCode> {
    if let Some(authority) = request.uri().authority().cloned() {
        if !request.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(authority.as_str()).map_err(|_| StatusCode::BAD_REQUEST)?;
            request.headers_mut().insert(HOST, host);
        }
        let path = request
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *request.uri_mut() = Uri::from(path);
    }

    if request.version() == Version::HTTP_11 && !request.headers().contains_key(HOST) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let h2c_offer = offers_h2c(request.headers());
    if h2c_offer {
        request.headers_mut().remove(UPGRADE);
        request.headers_mut().remove(HTTP2_SETTINGS);
    }
    Ok(h2c_offer)
}

impl Stage for Normalizer {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        let Inbound::Request(mut request) = msg else {
            ctx.fire_inbound(msg);
            return Ok(());
        };

        match normalize(&mut request) {
            Ok(h2c_offer) => {
                if h2c_offer {
                    tracing::trace!(
                        connection_id = %ctx.connection().id(),
                        uri = %request.uri(),
                        "Stripped h2c upgrade offer, serving over HTTP/1.1"
                    );
                }
                ctx.fire_inbound(Inbound::Request(request));
            }
            Err(status) => {
                tracing::debug!(
                    connection_id = %ctx.connection().id(),
                    status = status.as_u16(),
                    uri = %request.uri(),
                    "Refusing request"
                );
                ctx.fire_outbound(Outbound::Response(error_response(status)));
            }
        }
        Ok(())
    }
}
