//! Stage trait, the messages that travel through a chain, and the context a
//! stage uses to emit messages and mutate its chain.

use bytes::{Bytes, BytesMut};
use http::{request, response, Request, Response};

use crate::codec::bridge::ContentFrame;
use crate::observability::access::AccessLogEntry;
use crate::pipeline::context::ConnectionContext;
use crate::pipeline::PipelineError;

/// Messages travelling from the transport towards the dispatcher.
#[derive(Debug)]
pub enum Inbound {
    /// Bytes exactly as read from the socket.
    Transport(BytesMut),
    /// Internal byte buffer (ciphertext before TLS, plaintext after).
    Data(Bytes),
    /// Decoded HTTP/1.1 request head.
    Head(Box<request::Parts>),
    /// A piece of request body.
    Body(Bytes),
    /// End of the current request body.
    End,
    /// Fully aggregated request.
    Request(Request<Bytes>),
    Event(PipelineEvent),
}

impl Inbound {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Inbound::Transport(_) => "transport buffer",
            Inbound::Data(_) => "data",
            Inbound::Head(_) => "request head",
            Inbound::Body(_) => "body",
            Inbound::End => "end of body",
            Inbound::Request(_) => "request",
            Inbound::Event(_) => "event",
        }
    }
}

/// Notifications fired through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The TLS handshake finished; ALPN is recorded on the connection.
    HandshakeComplete,
    /// The client opened with the HTTP/2 connection preface.
    PriorKnowledge,
    /// The peer closed its write side.
    ReadClosed,
}

/// Messages travelling from the dispatcher towards the transport.
#[derive(Debug)]
pub enum Outbound {
    /// Complete response produced by the dispatcher (or an error stage).
    Response(Response<Bytes>),
    /// Response head about to be framed.
    Head(Box<response::Parts>),
    /// One body chunk.
    Chunk(Bytes),
    /// Terminates the current response body.
    Last,
    /// Internal byte buffer (plaintext before TLS, ciphertext after).
    Data(Bytes),
    /// Frame ready for the socket.
    Frame(ContentFrame),
    /// Close the connection once everything before it is written.
    Close,
}

impl Outbound {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Outbound::Response(_) => "response",
            Outbound::Head(_) => "response head",
            Outbound::Chunk(_) => "chunk",
            Outbound::Last => "last chunk",
            Outbound::Data(_) => "data",
            Outbound::Frame(_) => "frame",
            Outbound::Close => "close",
        }
    }
}

/// One processing step of a connection chain.
///
/// The default implementations forward everything unchanged, so a stage only
/// overrides the direction it cares about.
pub trait Stage: Send {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        ctx.fire_inbound(msg);
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        ctx.fire_outbound(msg);
        Ok(())
    }
}

/// A stage together with the unique name it is registered under.
pub struct NamedStage {
    pub name: &'static str,
    pub stage: Box<dyn Stage>,
}

impl NamedStage {
    pub fn new(name: &'static str, stage: impl Stage + 'static) -> Self {
        Self {
            name,
            stage: Box::new(stage),
        }
    }
}

impl std::fmt::Debug for NamedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedStage").field("name", &self.name).finish()
    }
}

/// Where an emitted message continues.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Route {
    /// Next live stage after the emitting one.
    Next,
    /// Next live stage after the named one.
    AfterNamed(&'static str),
    /// Previous live stage before the emitting one.
    Previous,
}

#[derive(Debug)]
pub(crate) enum Emission {
    Inbound(Route, Inbound),
    Outbound(Route, Outbound),
}

pub(crate) enum Mutation {
    InsertBefore { anchor: &'static str, stage: NamedStage },
    InsertAfter { anchor: &'static str, stage: NamedStage },
    Replace { name: &'static str, stage: NamedStage },
    Remove { name: &'static str, required: bool },
}

/// Side channels surfaced to the connection driver.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub(crate) frames: Vec<ContentFrame>,
    pub(crate) dispatch: std::collections::VecDeque<Request<Bytes>>,
    pub(crate) access: Vec<AccessLogEntry>,
}

/// Handle given to a stage for the duration of one callback.
///
/// Emissions and chain mutations are recorded and applied by the chain once
/// the callback returns: mutations first, in call order, then emissions in
/// call order.
pub struct StageContext<'a> {
    name: &'static str,
    conn: &'a mut ConnectionContext,
    output: &'a mut PipelineOutput,
    emissions: Vec<Emission>,
    mutations: Vec<Mutation>,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        name: &'static str,
        conn: &'a mut ConnectionContext,
        output: &'a mut PipelineOutput,
    ) -> Self {
        Self {
            name,
            conn,
            output,
            emissions: Vec::new(),
            mutations: Vec::new(),
        }
    }

    /// Name of the stage being invoked.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn connection(&self) -> &ConnectionContext {
        &*self.conn
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionContext {
        &mut *self.conn
    }

    /// Passes a message to the next stage towards the dispatcher.
    pub fn fire_inbound(&mut self, msg: Inbound) {
        self.emissions.push(Emission::Inbound(Route::Next, msg));
    }

    /// Passes a message to the stage following `anchor`, resolved after this
    /// callback's mutations were applied.
    pub fn fire_inbound_after(&mut self, anchor: &'static str, msg: Inbound) {
        self.emissions.push(Emission::Inbound(Route::AfterNamed(anchor), msg));
    }

    /// Passes a message to the previous stage towards the transport.
    pub fn fire_outbound(&mut self, msg: Outbound) {
        self.emissions.push(Emission::Outbound(Route::Previous, msg));
    }

    pub fn insert_before(&mut self, anchor: &'static str, stage: NamedStage) {
        self.mutations.push(Mutation::InsertBefore { anchor, stage });
    }

    pub fn insert_after(&mut self, anchor: &'static str, stage: NamedStage) {
        self.mutations.push(Mutation::InsertAfter { anchor, stage });
    }

    /// Puts `stage` where `name` is. Messages fired from the replaced stage
    /// continue into its replacement.
    pub fn replace(&mut self, name: &'static str, stage: NamedStage) {
        self.mutations.push(Mutation::Replace { name, stage });
    }

    /// Removes a stage; missing stages fail the callback.
    pub fn remove(&mut self, name: &'static str) {
        self.mutations.push(Mutation::Remove { name, required: true });
    }

    /// Removes a stage when present.
    pub fn remove_if_present(&mut self, name: &'static str) {
        self.mutations.push(Mutation::Remove { name, required: false });
    }

    /// Removes the stage being invoked. Messages it fires still continue from
    /// its former position.
    pub fn remove_self(&mut self) {
        let name = self.name;
        self.remove(name);
    }

    /// Queues a complete request for the dispatcher.
    pub fn dispatch(&mut self, request: Request<Bytes>) {
        self.output.dispatch.push_back(request);
    }

    /// Queues an access log entry; the driver hands it to the sink after the
    /// response bytes were written.
    pub fn log_access(&mut self, entry: AccessLogEntry) {
        self.output.access.push(entry);
    }

    pub(crate) fn into_effects(self) -> (Vec<Emission>, Vec<Mutation>) {
        (self.emissions, self.mutations)
    }
}
