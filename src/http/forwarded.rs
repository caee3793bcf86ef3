//! Forwarded header handling ahead of the dispatcher.

use std::net::IpAddr;
use std::sync::Arc;

use http::HeaderMap;

use crate::observability::metrics;
use crate::pipeline::{Inbound, PipelineError, Stage, StageContext};
use crate::security::{forwarded, ForwardedChain, TrustedProxies};

/// Parses and verifies the forwarding headers of one request. Anything
/// malformed or untrusted yields `None`.
pub fn resolve(headers: &HeaderMap, peer: IpAddr, proxies: &TrustedProxies) -> Option<ForwardedChain> {
    let chain = match forwarded::parse(headers) {
        Ok(Some(chain)) => chain,
        Ok(None) => return None,
        Err(e) => {
            metrics::forwarded_rejected();
            tracing::debug!(peer_addr = %peer, error = %e, "Ignoring malformed forwarding headers");
            return None;
        }
    };
    if !proxies.verify(&chain, peer) {
        metrics::forwarded_rejected();
        tracing::debug!(peer_addr = %peer, client = ?chain.client(), "Ignoring forwarding headers from an untrusted chain");
        return None;
    }
    Some(chain)
}

/// Stores the trusted forwarded chain of each request on the connection, where
/// the dispatcher stage picks it up.
#[derive(Debug)]
pub struct ForwardedStage {
    proxies: Arc<TrustedProxies>,
}

impl ForwardedStage {
    pub fn new(proxies: Arc<TrustedProxies>) -> Self {
        Self { proxies }
    }
}

impl Stage for ForwardedStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        if let Inbound::Request(request) = &msg {
            let peer = ctx.connection().peer_addr().ip();
            let chain = resolve(request.headers(), peer, &self.proxies);
            ctx.connection_mut().set_forwarded(chain);
        }
        ctx.fire_inbound(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::proxies::DEFAULT_PROXIES;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn trusted_peer_keeps_chain() {
        let proxies = TrustedProxies::new(DEFAULT_PROXIES).unwrap();
        let chain = resolve(
            &headers(&[("forwarded", "for=203.0.113.9;proto=https")]),
            "10.0.0.2".parse().unwrap(),
            &proxies,
        )
        .unwrap();
        assert_eq!(chain.client(), Some("203.0.113.9"));
        assert_eq!(chain.proto(), Some("https"));
    }

    #[test]
    fn untrusted_or_malformed_is_dropped() {
        let proxies = TrustedProxies::new(DEFAULT_PROXIES).unwrap();
        let public_peer: IpAddr = "198.51.100.20".parse().unwrap();
        assert!(resolve(&headers(&[("forwarded", "for=203.0.113.9")]), public_peer, &proxies).is_none());

        let private_peer: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(resolve(&headers(&[("forwarded", "for=[::1")]), private_peer, &proxies).is_none());
        assert!(resolve(&HeaderMap::new(), private_peer, &proxies).is_none());
    }
}
