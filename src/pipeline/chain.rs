//! Ordered, named stage chain and the per-connection pipeline that drives it.
//!
//! # Delivery model
//! - Delivery is depth first: every message a stage fires is carried through
//!   the whole chain before the next sibling message starts.
//! - A stage's mutations are applied as soon as its callback returns and before
//!   the messages it fired are routed.
//! - Removed stages stay in place as tombstones until the current delivery
//!   drains, so "next after me" keeps working for a stage that removed itself.

use bytes::{Bytes, BytesMut};
use http::{Request, Response};

use crate::codec::bridge::ContentFrame;
use crate::observability::access::AccessLogEntry;
use crate::pipeline::context::ConnectionContext;
use crate::pipeline::names;
use crate::pipeline::stage::{
    Emission, Inbound, Mutation, NamedStage, Outbound, PipelineEvent, PipelineOutput, Route,
    Stage, StageContext,
};
use crate::pipeline::PipelineError;

type StageKey = u64;

struct Entry {
    key: StageKey,
    name: &'static str,
    stage: Box<dyn Stage>,
    removed: bool,
}

/// Ordered sequence of uniquely named stages.
#[derive(Default)]
pub struct StageChain {
    entries: Vec<Entry>,
    next_key: StageKey,
}

impl StageChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage at the tail.
    pub fn add_last(&mut self, stage: NamedStage) -> Result<(), PipelineError> {
        let index = self.entries.len();
        self.insert_at(index, stage)
    }

    pub fn insert_before(&mut self, anchor: &str, stage: NamedStage) -> Result<(), PipelineError> {
        let index = self.require(anchor)?;
        self.insert_at(index, stage)
    }

    pub fn insert_after(&mut self, anchor: &str, stage: NamedStage) -> Result<(), PipelineError> {
        let index = self.require(anchor)?;
        self.insert_at(index + 1, stage)
    }

    /// Removes a stage. Surviving stages keep their relative order.
    pub fn remove(&mut self, name: &str) -> Result<(), PipelineError> {
        let index = self.require(name)?;
        self.entries[index].removed = true;
        Ok(())
    }

    /// Swaps the named stage for `stage` at the same position.
    pub fn replace(&mut self, name: &str, stage: NamedStage) -> Result<(), PipelineError> {
        let index = self.require(name)?;
        if stage.name != name && self.contains(stage.name) {
            return Err(PipelineError::DuplicateStage(stage.name));
        }
        self.entries[index].removed = true;
        self.insert_at(index + 1, stage)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Names of the live stages, head first.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|e| !e.removed)
            .map(|e| e.name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_at(&mut self, index: usize, stage: NamedStage) -> Result<(), PipelineError> {
        if self.contains(stage.name) {
            return Err(PipelineError::DuplicateStage(stage.name));
        }
        let key = self.next_key;
        self.next_key += 1;
        self.entries.insert(
            index,
            Entry {
                key,
                name: stage.name,
                stage: stage.stage,
                removed: false,
            },
        );
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.removed && e.name == name)
    }

    fn require(&self, name: &str) -> Result<usize, PipelineError> {
        self.position(name)
            .ok_or_else(|| PipelineError::NoSuchStage(name.to_string()))
    }

    fn key_position(&self, key: StageKey) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    fn next_live(&self, from: usize) -> Option<usize> {
        (from..self.entries.len()).find(|&i| !self.entries[i].removed)
    }

    fn previous_live(&self, before: usize) -> Option<usize> {
        (0..before).rev().find(|&i| !self.entries[i].removed)
    }

    fn compact(&mut self) {
        self.entries.retain(|e| !e.removed);
    }
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Anchor {
    Head,
    At(StageKey),
    After(StageKey),
    AfterNamed(&'static str),
    Before(StageKey),
}

#[derive(Debug)]
enum Message {
    In(Inbound),
    Out(Outbound),
}

#[derive(Debug)]
struct Pending {
    anchor: Anchor,
    message: Message,
}

impl Pending {
    fn from_emission(emission: Emission, origin: StageKey) -> Self {
        let (route, message) = match emission {
            Emission::Inbound(route, msg) => (route, Message::In(msg)),
            Emission::Outbound(route, msg) => (route, Message::Out(msg)),
        };
        let anchor = match route {
            Route::Next => Anchor::After(origin),
            Route::AfterNamed(name) => Anchor::AfterNamed(name),
            Route::Previous => Anchor::Before(origin),
        };
        Self { anchor, message }
    }

    fn is_outbound(&self) -> bool {
        matches!(self.message, Message::Out(_))
    }
}

/// A connection's chain together with its context and driver-facing output.
pub struct Pipeline {
    chain: StageChain,
    conn: ConnectionContext,
    output: PipelineOutput,
}

impl Pipeline {
    pub fn new(chain: StageChain, conn: ConnectionContext) -> Self {
        Self {
            chain,
            conn,
            output: PipelineOutput::default(),
        }
    }

    pub fn chain(&self) -> &StageChain {
        &self.chain
    }

    pub fn connection(&self) -> &ConnectionContext {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionContext {
        &mut self.conn
    }

    /// Feeds bytes read from the socket in at the head of the chain.
    pub fn read(&mut self, buf: BytesMut) -> Result<(), PipelineError> {
        self.deliver(Inbound::Transport(buf))
    }

    pub fn fire_event(&mut self, event: PipelineEvent) -> Result<(), PipelineError> {
        self.deliver(Inbound::Event(event))
    }

    /// Delivers an arbitrary inbound message at the head.
    #[cfg(test)]
    pub(crate) fn inject(&mut self, msg: Inbound) -> Result<(), PipelineError> {
        self.deliver(msg)
    }

    fn deliver(&mut self, msg: Inbound) -> Result<(), PipelineError> {
        self.run(Pending {
            anchor: Anchor::Head,
            message: Message::In(msg),
        })
    }

    /// Injects an outbound message at the named stage.
    pub fn write_from(&mut self, name: &str, msg: Outbound) -> Result<(), PipelineError> {
        let index = self.chain.require(name)?;
        let key = self.chain.entries[index].key;
        self.run(Pending {
            anchor: Anchor::At(key),
            message: Message::Out(msg),
        })
    }

    /// Writes the dispatcher's response for the oldest outstanding request.
    pub fn respond(&mut self, response: Response<Bytes>) -> Result<(), PipelineError> {
        self.write_from(names::DISPATCHER, Outbound::Response(response))
    }

    pub fn next_dispatch(&mut self) -> Option<Request<Bytes>> {
        self.output.dispatch.pop_front()
    }

    pub fn has_pending_dispatch(&self) -> bool {
        !self.output.dispatch.is_empty()
    }

    pub fn take_frames(&mut self) -> Vec<ContentFrame> {
        std::mem::take(&mut self.output.frames)
    }

    pub fn take_access_entries(&mut self) -> Vec<AccessLogEntry> {
        std::mem::take(&mut self.output.access)
    }

    fn run(&mut self, first: Pending) -> Result<(), PipelineError> {
        let mut stack = vec![first];
        let mut failure: Option<PipelineError> = None;

        while let Some(pending) = stack.pop() {
            match self.step(pending) {
                Ok(next) => stack.extend(next.into_iter().rev()),
                Err((err, next)) => {
                    if failure.is_some() {
                        tracing::debug!(connection_id = %self.conn.id(), error = %err, "Further stage error while failing");
                        continue;
                    }
                    // Only what the failing stage sent towards the transport
                    // (typically an error response) is still delivered.
                    stack.clear();
                    stack.extend(next.into_iter().filter(Pending::is_outbound).rev());
                    failure = Some(err);
                }
            }
        }

        self.chain.compact();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resolve(&self, anchor: Anchor, inbound: bool) -> Result<Option<usize>, PipelineError> {
        let chain = &self.chain;
        let index = match anchor {
            Anchor::Head => chain.next_live(0),
            Anchor::At(key) => chain
                .key_position(key)
                .filter(|&i| !chain.entries[i].removed),
            Anchor::After(key) => chain.key_position(key).and_then(|i| chain.next_live(i + 1)),
            Anchor::AfterNamed(name) => chain.next_live(chain.require(name)? + 1),
            Anchor::Before(key) => chain.key_position(key).and_then(|i| chain.previous_live(i)),
        };
        debug_assert!(inbound || !matches!(anchor, Anchor::Head));
        Ok(index)
    }

    fn step(&mut self, pending: Pending) -> Result<Vec<Pending>, (PipelineError, Vec<Pending>)> {
        let inbound = matches!(pending.message, Message::In(_));
        let index = match self.resolve(pending.anchor, inbound) {
            Ok(Some(index)) => index,
            Ok(None) => {
                self.past_end(pending.message);
                return Ok(Vec::new());
            }
            Err(err) => return Err((err, Vec::new())),
        };

        let entry = &mut self.chain.entries[index];
        let key = entry.key;
        let mut ctx = StageContext::new(entry.name, &mut self.conn, &mut self.output);
        let result = match pending.message {
            Message::In(msg) => entry.stage.inbound(&mut ctx, msg),
            Message::Out(msg) => entry.stage.outbound(&mut ctx, msg),
        };
        let (emissions, mutations) = ctx.into_effects();
        let next: Vec<Pending> = emissions
            .into_iter()
            .map(|e| Pending::from_emission(e, key))
            .collect();

        if let Err(err) = result {
            return Err((err, next));
        }
        for mutation in mutations {
            if let Err(err) = self.apply(mutation) {
                return Err((err, next));
            }
        }
        Ok(next)
    }

    fn apply(&mut self, mutation: Mutation) -> Result<(), PipelineError> {
        match mutation {
            Mutation::InsertBefore { anchor, stage } => {
                tracing::trace!(connection_id = %self.conn.id(), stage = stage.name, anchor, "Inserting stage");
                self.chain.insert_before(anchor, stage)
            }
            Mutation::InsertAfter { anchor, stage } => {
                tracing::trace!(connection_id = %self.conn.id(), stage = stage.name, anchor, "Inserting stage");
                self.chain.insert_after(anchor, stage)
            }
            Mutation::Replace { name, stage } => {
                tracing::trace!(connection_id = %self.conn.id(), stage = stage.name, replaced = name, "Replacing stage");
                self.chain.replace(name, stage)
            }
            Mutation::Remove { name, required } => {
                if !required && !self.chain.contains(name) {
                    return Ok(());
                }
                tracing::trace!(connection_id = %self.conn.id(), stage = name, "Removing stage");
                self.chain.remove(name)
            }
        }
    }

    fn past_end(&mut self, message: Message) {
        match message {
            Message::Out(Outbound::Frame(frame)) => self.output.frames.push(frame),
            Message::Out(Outbound::Data(bytes)) => self.output.frames.push(ContentFrame::new(bytes)),
            Message::Out(Outbound::Close) => self.output.frames.push(ContentFrame::end_of_stream()),
            Message::Out(other) => {
                tracing::warn!(connection_id = %self.conn.id(), message = other.kind(), "Unframed outbound message reached the transport");
            }
            Message::In(other) => {
                tracing::trace!(connection_id = %self.conn.id(), message = other.kind(), "Inbound message passed the chain tail");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every inbound message and forwards it.
    struct Recorder {
        label: &'static str,
        log: Log,
    }

    impl Stage for Recorder {
        fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
            let entry = match &msg {
                Inbound::Data(b) => format!("{}:{}", self.label, String::from_utf8_lossy(b)),
                other => format!("{}:{}", self.label, other.kind()),
            };
            self.log.lock().unwrap().push(entry);
            ctx.fire_inbound(msg);
            Ok(())
        }
    }

    /// Converts transport buffers and splits data on spaces.
    struct Splitter;

    impl Stage for Splitter {
        fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
            if let Inbound::Transport(buf) = msg {
                for word in buf[..].split(|b| *b == b' ') {
                    ctx.fire_inbound(Inbound::Data(Bytes::copy_from_slice(word)));
                }
            }
            Ok(())
        }
    }

    /// On the first message inserts a recorder after `anchor` and removes
    /// itself, re-delivering the message to the inserted stage.
    struct OneShot {
        anchor: &'static str,
        log: Log,
        fired: bool,
    }

    impl Stage for OneShot {
        fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
            assert!(!self.fired, "one-shot stage invoked twice");
            self.fired = true;
            ctx.insert_after(
                self.anchor,
                NamedStage::new("inserted", Recorder { label: "inserted", log: self.log.clone() }),
            );
            ctx.remove_self();
            ctx.fire_inbound_after(self.anchor, msg);
            Ok(())
        }
    }

    fn pipeline(chain: StageChain) -> Pipeline {
        let conn = ConnectionContext::new(
            ConnectionId::new(),
            false,
            "127.0.0.1:8080".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        );
        Pipeline::new(chain, conn)
    }

    fn recorder(label: &'static str, log: &Log) -> NamedStage {
        NamedStage::new(label, Recorder { label, log: log.clone() })
    }

    #[test]
    fn names_are_unique() {
        let log = Log::default();
        let mut chain = StageChain::new();
        chain.add_last(recorder("a", &log)).unwrap();
        let err = chain.add_last(recorder("a", &log)).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStage("a")));
    }

    #[test]
    fn insertion_and_removal_preserve_order() {
        let log = Log::default();
        let mut chain = StageChain::new();
        chain.add_last(recorder("a", &log)).unwrap();
        chain.add_last(recorder("d", &log)).unwrap();
        chain.insert_after("a", recorder("b", &log)).unwrap();
        chain.insert_before("d", recorder("c", &log)).unwrap();
        assert_eq!(chain.names(), vec!["a", "b", "c", "d"]);

        chain.remove("b").unwrap();
        assert_eq!(chain.names(), vec!["a", "c", "d"]);
        assert!(chain.remove("b").is_err());
        assert!(chain.insert_after("missing", recorder("x", &log)).is_err());
    }

    #[test]
    fn replace_keeps_the_position() {
        let log = Log::default();
        let mut chain = StageChain::new();
        chain.add_last(recorder("a", &log)).unwrap();
        chain.add_last(recorder("b", &log)).unwrap();
        chain.add_last(recorder("c", &log)).unwrap();

        chain.replace("b", recorder("x", &log)).unwrap();
        assert_eq!(chain.names(), vec!["a", "x", "c"]);

        chain.replace("x", recorder("x", &log)).unwrap();
        assert_eq!(chain.names(), vec!["a", "x", "c"]);

        assert!(matches!(
            chain.replace("x", recorder("a", &log)),
            Err(PipelineError::DuplicateStage("a"))
        ));
        assert!(chain.replace("missing", recorder("y", &log)).is_err());
        assert_eq!(chain.names(), vec!["a", "x", "c"]);
    }

    #[test]
    fn delivery_is_depth_first() {
        let log = Log::default();
        let mut chain = StageChain::new();
        chain.add_last(NamedStage::new("split", Splitter)).unwrap();
        chain.add_last(recorder("one", &log)).unwrap();
        chain.add_last(recorder("two", &log)).unwrap();

        let mut p = pipeline(chain);
        p.read(BytesMut::from("x y")).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["one:x", "two:x", "one:y", "two:y"]
        );
    }

    #[test]
    fn self_removing_stage_redirects_and_never_runs_again() {
        let log = Log::default();
        let mut chain = StageChain::new();
        chain.add_last(NamedStage::new("split", Splitter)).unwrap();
        chain.add_last(recorder("before", &log)).unwrap();
        chain
            .add_last(NamedStage::new(
                "once",
                OneShot { anchor: "before", log: log.clone(), fired: false },
            ))
            .unwrap();
        chain.add_last(recorder("tail", &log)).unwrap();

        let mut p = pipeline(chain);
        p.read(BytesMut::from("x y")).unwrap();

        assert_eq!(p.chain().names(), vec!["split", "before", "inserted", "tail"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:x", "inserted:x", "tail:x",
                "before:y", "inserted:y", "tail:y",
            ]
        );
    }

    #[test]
    fn outbound_past_head_becomes_frames() {
        let log = Log::default();
        let mut chain = StageChain::new();
        chain.add_last(recorder("a", &log)).unwrap();
        chain.add_last(recorder(names::DISPATCHER, &log)).unwrap();

        let mut p = pipeline(chain);
        p.write_from(names::DISPATCHER, Outbound::Data(Bytes::from_static(b"hi")))
            .unwrap();
        p.write_from(names::DISPATCHER, Outbound::Close).unwrap();
        let frames = p.take_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload(), &Bytes::from_static(b"hi"));
        assert!(frames[1].is_end_of_stream());
        assert!(p.write_from("missing", Outbound::Close).is_err());
    }
}
