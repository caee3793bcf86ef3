//! Trust decision for forwarded data.

use std::net::IpAddr;

use regex::Regex;

use crate::security::forwarded::ForwardedChain;

/// Loopback, link-local and private ranges.
pub const DEFAULT_PROXIES: &str = r"^(10\.\d{1,3}\.\d{1,3}\.\d{1,3}|192\.168\.\d{1,3}\.\d{1,3}|169\.254\.\d{1,3}\.\d{1,3}|127\.\d{1,3}\.\d{1,3}\.\d{1,3}|172\.(1[6-9]|2[0-9]|3[0-1])\.\d{1,3}\.\d{1,3}|::1|0:0:0:0:0:0:0:1|[fF][eE][89abAB][0-9a-fA-F]:.*|[fF][cdCD][0-9a-fA-F]{2}:.*)$";

/// Matches addresses of proxies whose forwarding headers are believed.
#[derive(Debug, Clone)]
pub struct TrustedProxies {
    pattern: Regex,
}

impl TrustedProxies {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_trusted(&self, addr: &str) -> bool {
        self.pattern.is_match(addr)
    }

    /// Decides whether `chain`, received from `peer`, may be used.
    ///
    /// The peer and every intermediate `for` hop must be trusted proxies, and
    /// the originating client must be a concrete, non-obfuscated node.
    pub fn verify(&self, chain: &ForwardedChain, peer: IpAddr) -> bool {
        if !self.is_trusted(&peer.to_string()) {
            return false;
        }
        let Some((client, hops)) = chain.for_list().split_first() else {
            return false;
        };
        if client.eq_ignore_ascii_case("unknown") || client.starts_with('_') {
            return false;
        }
        if !hops.iter().all(|hop| self.is_trusted(hop)) {
            return false;
        }
        chain
            .port()
            .map_or(true, |port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::forwarded::parse;
    use http::{HeaderMap, HeaderValue};

    fn chain(value: &'static str) -> ForwardedChain {
        let mut headers = HeaderMap::new();
        headers.insert("forwarded", HeaderValue::from_static(value));
        parse(&headers).unwrap().unwrap()
    }

    #[test]
    fn default_pattern_covers_private_ranges() {
        let proxies = TrustedProxies::new(DEFAULT_PROXIES).unwrap();
        for addr in ["10.1.2.3", "192.168.0.1", "172.16.5.4", "127.0.0.1", "::1", "fd12:3456::1"] {
            assert!(proxies.is_trusted(addr), "{addr}");
        }
        for addr in ["8.8.8.8", "172.32.0.1", "2001:db8::1"] {
            assert!(!proxies.is_trusted(addr), "{addr}");
        }
    }

    #[test]
    fn trust_requires_trusted_peer_and_hops() {
        let proxies = TrustedProxies::new(DEFAULT_PROXIES).unwrap();
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let public: IpAddr = "203.0.113.9".parse().unwrap();

        assert!(proxies.verify(&chain("for=198.51.100.7, for=10.0.0.2"), local));
        assert!(!proxies.verify(&chain("for=198.51.100.7"), public));
        assert!(!proxies.verify(&chain("for=198.51.100.7, for=203.0.113.5"), local));
    }

    #[test]
    fn obfuscated_clients_and_bad_ports_are_rejected() {
        let proxies = TrustedProxies::new(DEFAULT_PROXIES).unwrap();
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(!proxies.verify(&chain("for=unknown"), local));
        assert!(!proxies.verify(&chain("for=_hidden"), local));
        assert!(!proxies.verify(&chain("for=\"198.51.100.7:_port\""), local));
        assert!(proxies.verify(&chain("for=\"198.51.100.7:8080\""), local));
        assert!(!proxies.verify(&chain("proto=https"), local));
    }
}
