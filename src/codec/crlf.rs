//! Guard against connections that open with a run of bare CRLFs.

use bytes::{Bytes, BytesMut};

use crate::codec::CodecError;
use crate::observability::metrics;
use crate::pipeline::{Inbound, PipelineError, Stage, StageContext};

/// Result of scanning the head of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlfScan {
    /// The run ended with `count` complete pairs.
    Complete(usize),
    /// The input ended inside the run; more bytes are needed.
    Incomplete(usize),
}

/// Counts consecutive `\r\n` pairs at the start of `buf` without consuming.
pub fn scan_leading_crlf(buf: &[u8]) -> CrlfScan {
    let mut count = 0;
    let mut rest = buf;
    loop {
        match rest {
            [b'\r', b'\n', tail @ ..] => {
                count += 1;
                rest = tail;
            }
            [] | [b'\r'] => return CrlfScan::Incomplete(count),
            _ => return CrlfScan::Complete(count),
        }
    }
}

/// Rejects the connection when more than `max_leading` CRLF pairs precede
/// the first request line, then removes itself.
#[derive(Debug)]
pub struct CrlfGuard {
    max_leading: usize,
    pending: BytesMut,
}

impl CrlfGuard {
    pub fn new(max_leading: usize) -> Self {
        Self {
            max_leading,
            pending: BytesMut::new(),
        }
    }
}

impl Stage for CrlfGuard {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        let data = match msg {
            Inbound::Data(data) => data,
            other => {
                ctx.fire_inbound(other);
                return Ok(());
            }
        };

        self.pending.extend_from_slice(&data);
        let count = match scan_leading_crlf(&self.pending) {
            CrlfScan::Complete(count) => count,
            CrlfScan::Incomplete(count) if count <= self.max_leading => {
                tracing::trace!(connection_id = %ctx.connection().id(), count, "Awaiting end of leading CRLF run");
                return Ok(());
            }
            CrlfScan::Incomplete(count) => count,
        };

        if count > self.max_leading {
            metrics::crlf_rejected();
            tracing::debug!(
                connection_id = %ctx.connection().id(),
                peer_addr = %ctx.connection().peer_addr(),
                count,
                max = self.max_leading,
                "Rejecting connection with leading CRLF run"
            );
            return Err(CodecError::ExcessiveLeadingCrlf {
                count,
                max: self.max_leading,
            }
            .into());
        }

        let buffered: Bytes = std::mem::take(&mut self.pending).freeze();
        ctx.remove_self();
        ctx.fire_inbound(Inbound::Data(buffered));
        Ok(())
    }
}
