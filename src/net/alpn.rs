//! Installs the protocol stages once TLS has negotiated ALPN.

use std::sync::Arc;

use crate::net::tls::ALPN_H2;
use crate::pipeline::{names, Assembler, Inbound, PipelineError, PipelineEvent, Protocol, Stage, StageContext};

/// Waits for the handshake, then splices the HTTP/1.1 set or the HTTP/2
/// bridge in front of the dispatcher and removes itself.
#[derive(Debug)]
pub struct AlpnStage {
    assembler: Arc<Assembler>,
}

impl AlpnStage {
    pub fn new(assembler: Arc<Assembler>) -> Self {
        Self { assembler }
    }
}

impl Stage for AlpnStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        match msg {
            Inbound::Event(PipelineEvent::HandshakeComplete) => {
                let name = ctx.name();
                let h2 = ctx.connection().alpn() == Some(ALPN_H2);
                let conn = ctx.connection_mut();
                if h2 {
                    conn.set_protocol(Protocol::H2);
                    conn.disable_half_closure();
                    ctx.replace(name, self.assembler.h2_bridge());
                } else {
                    conn.set_protocol(Protocol::Tls11);
                    conn.enable_half_closure();
                    for stage in self.assembler.http11_stages() {
                        ctx.insert_before(names::DISPATCHER, stage);
                    }
                    ctx.remove_self();
                }
                ctx.fire_inbound(msg);
                Ok(())
            }
            Inbound::Event(_) => {
                ctx.fire_inbound(msg);
                Ok(())
            }
            other => Err(PipelineError::Unexpected {
                stage: ctx.name(),
                message: format!("{} before the TLS handshake completed", other.kind()),
            }),
        }
    }
}
