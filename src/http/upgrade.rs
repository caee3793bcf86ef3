//! Cleartext HTTP/2: prior knowledge and the `Upgrade: h2c` handshake.
//!
//! # Responsibilities
//! - [`PrefaceDetector`]: recognise the prior-knowledge connection preface and
//!   swap the HTTP/1.1 framing stages for the HTTP/2 bridge
//! - [`H2cUpgrade`]: on the first HTTP/1.1 message, install the aggregator
//!   and normalizer; on the first full request, either answer `101` and
//!   replace the HTTP/1.1 stages with the bridge or step out of the chain
//!
//! # Design Decisions
//! - Both stages remove themselves after deciding, so the decision is made
//!   exactly once per connection
//! - Only the first request on a connection can upgrade

use bytes::{Bytes, BytesMut};
use http::Request;

use crate::http::h2::H2Bridge;
use crate::http::h2c;
use crate::pipeline::{
    names, Inbound, NamedStage, Outbound, PipelineError, PipelineEvent, Protocol, Stage, StageContext,
};

/// RFC 7540 §3.5 client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Stages that only make sense for HTTP/1.1 framing.
const HTTP11_STAGES: [&str; 8] = [
    names::HTTP_CODEC,
    names::CHUNK_LOGGING,
    names::CHUNKED_WRITE,
    names::ACCESS_LOG,
    names::COMPRESSION,
    names::RESPONSE_HEADERS,
    names::KEEP_ALIVE,
    names::FORWARDED,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefaceMatch {
    Full,
    Partial,
    Mismatch,
}

fn match_preface(buf: &[u8]) -> PrefaceMatch {
    let n = buf.len().min(PREFACE.len());
    if buf[..n] != PREFACE[..n] {
        PrefaceMatch::Mismatch
    } else if n == PREFACE.len() {
        PrefaceMatch::Full
    } else {
        PrefaceMatch::Partial
    }
}

/// Sits before the HTTP/1.1 codec on h2c-capable plaintext chains.
#[derive(Debug)]
pub struct PrefaceDetector {
    buffer: BytesMut,
    bridge: Option<NamedStage>,
}

impl PrefaceDetector {
    /// `bridge` is installed when the preface matches.
    pub fn new(bridge: NamedStage) -> Self {
        Self {
            buffer: BytesMut::new(),
            bridge: Some(bridge),
        }
    }

    fn step_aside(&mut self, ctx: &mut StageContext<'_>) {
        ctx.remove_self();
        if !self.buffer.is_empty() {
            ctx.fire_inbound(Inbound::Data(self.buffer.split().freeze()));
        }
    }
}

impl Stage for PrefaceDetector {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        let data = match msg {
            Inbound::Data(data) => data,
            other => {
                // Input ended before a decision: hand over what we have.
                self.step_aside(ctx);
                ctx.fire_inbound(other);
                return Ok(());
            }
        };
        self.buffer.extend_from_slice(&data);

        match match_preface(&self.buffer) {
            PrefaceMatch::Partial => Ok(()),
            PrefaceMatch::Mismatch => {
                self.step_aside(ctx);
                Ok(())
            }
            PrefaceMatch::Full => {
                let bridge = self.bridge.take().ok_or_else(|| PipelineError::Unexpected {
                    stage: ctx.name(),
                    message: "preface matched twice".to_string(),
                })?;
                tracing::debug!(connection_id = %ctx.connection().id(), "HTTP/2 prior knowledge preface");

                let conn = ctx.connection_mut();
                conn.set_protocol(Protocol::H2c);
                conn.disable_half_closure();
                for name in HTTP11_STAGES {
                    ctx.remove_if_present(name);
                }
                ctx.insert_after(names::H2_PREFACE, bridge);
                ctx.remove_self();
                ctx.fire_inbound(Inbound::Event(PipelineEvent::PriorKnowledge));
                ctx.fire_inbound(Inbound::Data(self.buffer.split().freeze()));
                Ok(())
            }
        }
    }
}

/// HTTP/1.1 fallback and `Upgrade: h2c` handling for h2c-capable plaintext
/// chains.
#[derive(Debug)]
pub struct H2cUpgrade {
    fallback: Option<(NamedStage, NamedStage)>,
    bridge: Option<H2Bridge>,
}

impl H2cUpgrade {
    /// `aggregator` and `normalizer` go around this stage when the connection
    /// turns out to speak HTTP/1.1; `bridge` takes over after an upgrade.
    pub fn new(aggregator: NamedStage, normalizer: NamedStage, bridge: H2Bridge) -> Self {
        Self {
            fallback: Some((aggregator, normalizer)),
            bridge: Some(bridge),
        }
    }

    fn decide(
        &mut self,
        ctx: &mut StageContext<'_>,
        request: Request<Bytes>,
    ) -> Result<(), PipelineError> {
        if h2c::offers_h2c(request.headers()) {
            match h2c::accept(&request) {
                Ok(frames) => return self.upgrade(ctx, &request, frames),
                Err(reason) => {
                    tracing::trace!(
                        connection_id = %ctx.connection().id(),
                        uri = %request.uri(),
                        reason = %reason,
                        "Declined h2c upgrade"
                    );
                }
            }
        }
        self.bridge = None;
        ctx.remove_self();
        ctx.fire_inbound(Inbound::Request(request));
        Ok(())
    }

    fn upgrade(
        &mut self,
        ctx: &mut StageContext<'_>,
        request: &Request<Bytes>,
        frames: Bytes,
    ) -> Result<(), PipelineError> {
        let bridge = self.bridge.take().ok_or_else(|| PipelineError::Unexpected {
            stage: ctx.name(),
            message: "upgrade accepted twice".to_string(),
        })?;
        tracing::debug!(connection_id = %ctx.connection().id(), uri = %request.uri(), "Upgrading to h2c");

        let conn = ctx.connection_mut();
        conn.set_protocol(Protocol::H2c);
        conn.disable_half_closure();
        for name in HTTP11_STAGES {
            ctx.remove_if_present(name);
        }
        ctx.remove_if_present(names::AGGREGATOR);
        ctx.remove_if_present(names::NORMALIZER);
        let name = ctx.name();
        ctx.replace(name, NamedStage::new(names::H2_BRIDGE, bridge.with_upgrade(frames)));
        ctx.fire_outbound(Outbound::Data(h2c::switching_protocols()));
        Ok(())
    }
}

impl Stage for H2cUpgrade {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        match msg {
            Inbound::Event(PipelineEvent::PriorKnowledge) => {
                self.fallback = None;
                self.bridge = None;
                ctx.remove_self();
                ctx.fire_inbound(msg);
                return Ok(());
            }
            Inbound::Event(_) => {
                ctx.fire_inbound(msg);
                return Ok(());
            }
            Inbound::Request(request) if self.fallback.is_none() => return self.decide(ctx, request),
            _ => {}
        }

        if ctx.connection().protocol().is_some_and(|p| p.is_http2()) {
            ctx.fire_inbound(msg);
            return Ok(());
        }

        let Some((aggregator, normalizer)) = self.fallback.take() else {
            ctx.fire_inbound(msg);
            return Ok(());
        };

        let name = ctx.name();
        let conn = ctx.connection_mut();
        conn.set_protocol(Protocol::Plaintext11);
        conn.enable_half_closure();
        ctx.insert_before(name, aggregator);
        ctx.insert_after(name, normalizer);
        ctx.fire_inbound_after(names::KEEP_ALIVE, msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bridge::BufferBridge;
    use crate::http::dispatch::InfoDispatcher;
    use crate::http::h2::H2Settings;
    use crate::net::connection::ConnectionId;
    use crate::pipeline::{ConnectionContext, Pipeline, StageChain};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder(Log);

    impl Stage for Recorder {
        fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
            let seen = match &msg {
                Inbound::Data(b) => format!("{}:{}", ctx.name(), String::from_utf8_lossy(b)),
                Inbound::Event(e) => format!("{}:{:?}", ctx.name(), e),
                other => format!("{}:{}", ctx.name(), other.kind()),
            };
            self.0.lock().unwrap().push(seen);
            ctx.fire_inbound(msg);
            Ok(())
        }
    }

    struct Swallow;

    impl Stage for Swallow {
        fn inbound(&mut self, _ctx: &mut StageContext<'_>, _msg: Inbound) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn connection() -> ConnectionContext {
        ConnectionContext::new(
            ConnectionId::new(),
            false,
            "127.0.0.1:80".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    fn preface_pipeline(log: &Log) -> Pipeline {
        let mut chain = StageChain::new();
        chain
            .add_last(NamedStage::new(
                names::H2_PREFACE,
                PrefaceDetector::new(NamedStage::new(names::H2_BRIDGE, Recorder(log.clone()))),
            ))
            .unwrap();
        chain.add_last(NamedStage::new(names::HTTP_CODEC, Recorder(log.clone()))).unwrap();
        chain.add_last(NamedStage::new(names::KEEP_ALIVE, Recorder(log.clone()))).unwrap();
        chain.add_last(NamedStage::new(names::DISPATCHER, Swallow)).unwrap();
        Pipeline::new(chain, connection())
    }

    #[test]
    fn preface_installs_the_bridge() {
        let log = Log::default();
        let mut p = preface_pipeline(&log);
        p.inject(Inbound::Data(Bytes::from_static(b"PRI * HTTP/2.0\r\n"))).unwrap();
        assert!(log.lock().unwrap().is_empty());
        p.inject(Inbound::Data(Bytes::from_static(b"\r\nSM\r\n\r\nframes"))).unwrap();

        assert_eq!(p.chain().names(), vec![names::H2_BRIDGE, names::DISPATCHER]);
        assert_eq!(p.connection().protocol(), Some(Protocol::H2c));
        assert!(!p.connection().half_closure_allowed());
        let log = log.lock().unwrap();
        assert_eq!(log[0], "h2-bridge:PriorKnowledge");
        assert_eq!(log[1], "h2-bridge:PRI * HTTP/2.0\r\n\r\nSM\r\n\r\nframes");
    }

    #[test]
    fn first_differing_byte_hands_over_to_http11() {
        let log = Log::default();
        let mut p = preface_pipeline(&log);
        p.inject(Inbound::Data(Bytes::from_static(b"PR"))).unwrap();
        p.inject(Inbound::Data(Bytes::from_static(b"OPFIND / HTTP/1.1\r\n"))).unwrap();

        assert!(!p.chain().contains(names::H2_PREFACE));
        assert_eq!(
            log.lock().unwrap()[0],
            "http-codec:PROPFIND / HTTP/1.1\r\n"
        );
        assert_eq!(p.connection().protocol(), None);
    }

    fn bridge() -> H2Bridge {
        H2Bridge::new(H2Settings {
            dispatcher: Arc::new(InfoDispatcher),
            access_log: None,
            proxies: None,
            forwarded_in_access_log: false,
        })
    }

    fn upgrade_pipeline(log: &Log) -> Pipeline {
        let mut chain = StageChain::new();
        chain.add_last(NamedStage::new(names::BUFFER_BRIDGE, BufferBridge)).unwrap();
        chain.add_last(NamedStage::new(names::HTTP_CODEC, Recorder(log.clone()))).unwrap();
        chain.add_last(NamedStage::new(names::KEEP_ALIVE, Recorder(log.clone()))).unwrap();
        chain
            .add_last(NamedStage::new(
                names::H2C_UPGRADE,
                H2cUpgrade::new(
                    NamedStage::new(names::AGGREGATOR, Recorder(log.clone())),
                    NamedStage::new(names::NORMALIZER, Recorder(log.clone())),
                    bridge(),
                ),
            ))
            .unwrap();
        chain.add_last(NamedStage::new(names::DISPATCHER, Swallow)).unwrap();
        Pipeline::new(chain, connection())
    }

    fn head() -> Inbound {
        let (parts, ()) = http::Request::get("/").body(()).unwrap().into_parts();
        Inbound::Head(Box::new(parts))
    }

    fn offer(settings: &[&'static str]) -> Inbound {
        let mut builder = http::Request::get("/")
            .header("host", "example.com")
            .header("connection", "Upgrade, HTTP2-Settings")
            .header("upgrade", "h2c");
        for value in settings {
            builder = builder.header(h2c::HTTP2_SETTINGS, *value);
        }
        Inbound::Request(builder.body(Bytes::new()).unwrap())
    }

    #[test]
    fn fallback_runs_once() {
        let log = Log::default();
        let mut p = upgrade_pipeline(&log);
        p.inject(head()).unwrap();
        p.inject(Inbound::End).unwrap();

        assert_eq!(
            p.chain().names(),
            vec![
                names::BUFFER_BRIDGE,
                names::HTTP_CODEC,
                names::KEEP_ALIVE,
                names::AGGREGATOR,
                names::H2C_UPGRADE,
                names::NORMALIZER,
                names::DISPATCHER
            ]
        );
        assert_eq!(p.connection().protocol(), Some(Protocol::Plaintext11));
        assert!(p.connection().half_closure_allowed());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "http-codec:request head",
                "keep-alive:request head",
                "aggregator:request head",
                "normalizer:request head",
                "http-codec:end of body",
                "keep-alive:end of body",
                "aggregator:end of body",
                "normalizer:end of body",
            ]
        );
    }

    #[test]
    fn plain_request_leaves_http11_in_place() {
        let log = Log::default();
        let mut p = upgrade_pipeline(&log);
        p.inject(head()).unwrap();
        let request = http::Request::get("/").body(Bytes::new()).unwrap();
        p.inject(Inbound::Request(request)).unwrap();

        assert_eq!(
            p.chain().names(),
            vec![
                names::BUFFER_BRIDGE,
                names::HTTP_CODEC,
                names::KEEP_ALIVE,
                names::AGGREGATOR,
                names::NORMALIZER,
                names::DISPATCHER
            ]
        );
        assert_eq!(log.lock().unwrap().last().unwrap(), "normalizer:request");
        assert!(p.take_frames().is_empty());
    }

    #[test]
    fn upgrade_switches_the_chain_to_http2() {
        let log = Log::default();
        let mut p = upgrade_pipeline(&log);
        p.inject(head()).unwrap();
        p.inject(offer(&["AAMAAABkAARAAAAAAAIAAAAA"])).unwrap();

        assert_eq!(p.chain().names(), vec![names::BUFFER_BRIDGE, names::H2_BRIDGE, names::DISPATCHER]);
        assert_eq!(p.connection().protocol(), Some(Protocol::H2c));
        assert!(!p.connection().half_closure_allowed());
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("normalizer:request")));

        let frames = p.take_frames();
        assert_eq!(frames.len(), 1);
        let head = String::from_utf8_lossy(frames[0].payload()).into_owned();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("upgrade: h2c\r\n"));
        assert!(head.contains("connection: Upgrade\r\n"));
    }

    #[test]
    fn invalid_offers_are_served_over_http11() {
        for settings in [&[][..], &["AAMAAABk", "AAMAAABk"][..], &["%%%"][..]] {
            let log = Log::default();
            let mut p = upgrade_pipeline(&log);
            p.inject(head()).unwrap();
            p.inject(offer(settings)).unwrap();

            assert!(!p.chain().contains(names::H2C_UPGRADE), "{settings:?}");
            assert!(!p.chain().contains(names::H2_BRIDGE), "{settings:?}");
            assert_eq!(p.connection().protocol(), Some(Protocol::Plaintext11));
            assert!(p.connection().half_closure_allowed());
            assert_eq!(log.lock().unwrap().last().unwrap(), "normalizer:request");
            assert!(p.take_frames().is_empty());
        }
    }

    #[test]
    fn prior_knowledge_skips_fallback() {
        let log = Log::default();
        let mut p = upgrade_pipeline(&log);
        p.fire_event(PipelineEvent::PriorKnowledge).unwrap();
        assert_eq!(
            p.chain().names(),
            vec![names::BUFFER_BRIDGE, names::HTTP_CODEC, names::KEEP_ALIVE, names::DISPATCHER]
        );
    }
}
