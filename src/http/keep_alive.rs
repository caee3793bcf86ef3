//! Persistent connection handling for HTTP/1.x.

use std::collections::VecDeque;

use http::header::CONNECTION;
use http::{HeaderMap, HeaderValue, Version};

use crate::pipeline::{Inbound, Outbound, PipelineError, Stage, StageContext};

/// Decides per request whether the connection survives the response, and
/// closes it after the response otherwise.
#[derive(Debug)]
pub struct KeepAliveStage {
    enabled: bool,
    max_requests: u32,
    served: u32,
    decisions: VecDeque<bool>,
}

impl KeepAliveStage {
    /// `max_requests` of 0 means unlimited.
    pub fn new(enabled: bool, max_requests: u32) -> Self {
        Self {
            enabled,
            max_requests,
            served: 0,
            decisions: VecDeque::new(),
        }
    }

    fn persistent(&mut self, version: Version, headers: &HeaderMap) -> bool {
        self.served += 1;
        if !self.enabled || (self.max_requests > 0 && self.served >= self.max_requests) {
            return false;
        }
        match version {
            Version::HTTP_11 => !has_token(headers, "close"),
            Version::HTTP_10 => has_token(headers, "keep-alive"),
            _ => false,
        }
    }
}

fn has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

impl Stage for KeepAliveStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        if let Inbound::Head(parts) = &msg {
            let keep = self.persistent(parts.version, &parts.headers);
            self.decisions.push_back(keep);
        }
        ctx.fire_inbound(msg);
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        let Outbound::Response(mut response) = msg else {
            ctx.fire_outbound(msg);
            return Ok(());
        };

        let keep = self.decisions.pop_front().unwrap_or(false) && !has_token(response.headers(), "close");
        let value = if keep { "keep-alive" } else { "close" };
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static(value));

        ctx.fire_outbound(Outbound::Response(response));
        if !keep {
            tracing::debug!(connection_id = %ctx.connection().id(), "Closing after response");
            ctx.fire_outbound(Outbound::Close);
        }
        Ok(())
    }
}
