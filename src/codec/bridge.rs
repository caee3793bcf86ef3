//! Adapter between socket buffers and the chain's internal buffers.

use bytes::Bytes;

use crate::pipeline::{Inbound, Outbound, PipelineError, Stage, StageContext};

/// Unit of data handed to the socket writer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentFrame {
    payload: Bytes,
    end_of_stream: bool,
}

impl ContentFrame {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            end_of_stream: false,
        }
    }

    /// Empty frame asking the writer to close after flushing.
    pub fn end_of_stream() -> Self {
        Self {
            payload: Bytes::new(),
            end_of_stream: true,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }
}

/// First stage of every chain.
///
/// Inbound transport buffers become `Data`; outbound `Data` and `Close`
/// become frames. One message in, one message out, nothing retained.
#[derive(Debug, Default)]
pub struct BufferBridge;

impl Stage for BufferBridge {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        match msg {
            // The transport buffer is consumed here; freezing hands its storage
            // over without a copy.
            Inbound::Transport(buf) => ctx.fire_inbound(Inbound::Data(buf.freeze())),
            other => ctx.fire_inbound(other),
        }
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        match msg {
            Outbound::Data(bytes) => ctx.fire_outbound(Outbound::Frame(ContentFrame::new(bytes))),
            Outbound::Close => ctx.fire_outbound(Outbound::Frame(ContentFrame::end_of_stream())),
            other => ctx.fire_outbound(other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use crate::pipeline::{names, ConnectionContext, NamedStage, Pipeline, StageChain};
    use bytes::BytesMut;
    use std::sync::{Arc, Mutex};

    struct Capture(Arc<Mutex<Vec<Bytes>>>);

    impl Stage for Capture {
        fn inbound(&mut self, _ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
            if let Inbound::Data(b) = msg {
                self.0.lock().unwrap().push(b);
            }
            Ok(())
        }
    }

    fn pipeline(seen: Arc<Mutex<Vec<Bytes>>>) -> Pipeline {
        let mut chain = StageChain::new();
        chain.add_last(NamedStage::new(names::BUFFER_BRIDGE, BufferBridge)).unwrap();
        chain.add_last(NamedStage::new(names::DISPATCHER, Capture(seen))).unwrap();
        let conn = ConnectionContext::new(
            ConnectionId::new(),
            false,
            "127.0.0.1:80".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
        );
        Pipeline::new(chain, conn)
    }

    #[test]
    fn transport_buffers_become_data() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut p = pipeline(seen.clone());
        p.read(BytesMut::from("GET")).unwrap();
        p.read(BytesMut::new()).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Bytes::from_static(b"GET"), Bytes::new()]
        );
    }

    #[test]
    fn empty_and_final_writes_are_framed() {
        let mut p = pipeline(Arc::default());
        p.write_from(names::DISPATCHER, Outbound::Data(Bytes::new())).unwrap();
        p.write_from(names::DISPATCHER, Outbound::Close).unwrap();
        let frames = p.take_frames();
        assert_eq!(frames[0], ContentFrame::new(Bytes::new()));
        assert!(frames[1].is_end_of_stream());
        assert!(frames[1].payload().is_empty());
    }
}
