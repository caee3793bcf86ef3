//! The application boundary and the terminal stage that feeds it.
//!
//! # Responsibilities
//! - Define [`Dispatcher`], the only way requests leave the pipeline
//! - Attach [`ConnectionInfo`] and trusted forwarded data as request extensions
//! - Refuse to dispatch on an HTTP/2 chain that still allows half-closure

use std::collections::VecDeque;
use std::future::Future;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response};

use crate::pipeline::{ConnectionInfo, Inbound, Outbound, PipelineError, Stage, StageContext};
use crate::security::ForwardedChain;

/// Application behind the pipeline.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: Request<Bytes>) -> BoxFuture<'static, Response<Bytes>>;
}

/// Adapts an async closure into a [`Dispatcher`].
pub struct FnDispatcher<F>(pub F);

impl<F, Fut> Dispatcher for FnDispatcher<F>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Bytes>> + Send + 'static,
{
    fn dispatch(&self, request: Request<Bytes>) -> BoxFuture<'static, Response<Bytes>> {
        (self.0)(request).boxed()
    }
}

/// Answers every request with a plain-text summary of what the pipeline saw.
#[derive(Debug, Default, Clone, Copy)]
pub struct InfoDispatcher;

impl Dispatcher for InfoDispatcher {
    fn dispatch(&self, request: Request<Bytes>) -> BoxFuture<'static, Response<Bytes>> {
        let mut body = format!("{} {}\n", request.method(), request.uri());
        if let Some(info) = request.extensions().get::<ConnectionInfo>() {
            body.push_str(&format!(
                "protocol: {}\nsecure: {}\npeer: {}\n",
                info.protocol, info.secure, info.peer_addr
            ));
        }
        if let Some(client) = request.extensions().get::<ForwardedChain>().and_then(ForwardedChain::client) {
            body.push_str(&format!("client: {}\n", client));
        }
        let mut response = Response::new(Bytes::from(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        futures_util::future::ready(response).boxed()
    }
}

/// Tail of every chain.
///
/// Requests are queued on the pipeline output; the connection driver awaits the
/// [`Dispatcher`] and writes the response back through [`Pipeline::respond`].
///
/// [`Pipeline::respond`]: crate::pipeline::Pipeline::respond
#[derive(Debug, Default)]
pub struct DispatchStage {
    forwarded: VecDeque<Option<ForwardedChain>>,
}

impl DispatchStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for DispatchStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        let conn = ctx.connection();
        if conn.protocol().is_some_and(|p| p.is_http2()) && conn.half_closure_allowed() {
            return Err(PipelineError::HalfClosureOnHttp2);
        }

        match msg {
            Inbound::Request(mut request) => {
                let forwarded = ctx.connection_mut().take_forwarded();
                request.extensions_mut().insert(ctx.connection().info());
                if let Some(chain) = &forwarded {
                    request.extensions_mut().insert(chain.clone());
                }
                self.forwarded.push_back(forwarded);
                ctx.dispatch(request);
            }
            Inbound::Event(_) => {}
            other => tracing::debug!(
                connection_id = %ctx.connection().id(),
                message = other.kind(),
                "Dispatcher ignored a partial message"
            ),
        }
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        match msg {
            Outbound::Response(mut response) => {
                if let Some(Some(chain)) = self.forwarded.pop_front() {
                    response.extensions_mut().insert(chain);
                }
                ctx.fire_outbound(Outbound::Response(response));
            }
            other => ctx.fire_outbound(other),
        }
        Ok(())
    }
}
