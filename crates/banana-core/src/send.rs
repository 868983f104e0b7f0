//! Outbound half of the codec: the slicer stack and its pump.
//!
//! Top-level sends are queued and serialized strictly in order. The pump
//! pulls children from the innermost slicer until the stack is empty; a
//! [`Value::Deferred`] that has not resolved parks the pump at exactly that
//! position until a later pump finds it settled.

use std::collections::{HashMap, VecDeque};

use banana_proto::{TokenWriter, Violation};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    banana::{BananaEvent, SendId},
    config::ReferenceScope,
    registry::VOCAB_OPENTYPE,
    slicer::{DictSlicer, FixedSlicer, Host, ListSlicer, Slicer, TupleSlicer},
    value::{Deferred, Value},
};

enum Outgoing {
    Value(Value),
    Vocab(Vec<Bytes>),
}

struct SendFrame<H> {
    slicer: Box<dyn Slicer<H>>,
    /// OPEN index, when the slicer is wrapped in OPEN/CLOSE
    open: Option<u64>,
}

pub(crate) struct Sender<H> {
    queue: VecDeque<(SendId, Outgoing)>,
    current: Option<SendId>,
    stack: Vec<SendFrame<H>>,
    waiting: Option<Deferred>,
    writer: TokenWriter,
    scope: ReferenceScope,
    next_open: u64,
    /// Shared composites already opened in this scope. The value is kept
    /// alive so its address cannot be reused while the entry exists.
    seen: HashMap<usize, (u64, Value)>,
    vocab: HashMap<Bytes, u64>,
    vocab_sent: bool,
    next_id: u64,
}

impl<H: Host> Sender<H> {
    pub(crate) fn new(scope: ReferenceScope) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            stack: Vec::new(),
            waiting: None,
            writer: TokenWriter::new(),
            scope,
            next_open: 0,
            seen: HashMap::new(),
            vocab: HashMap::new(),
            vocab_sent: false,
            next_id: 0,
        }
    }

    fn enqueue(&mut self, item: Outgoing) -> SendId {
        let id = SendId(self.next_id);
        self.next_id += 1;
        self.queue.push_back((id, item));
        id
    }

    pub(crate) fn send(&mut self, value: Value) -> SendId {
        self.enqueue(Outgoing::Value(value))
    }

    pub(crate) fn send_vocabulary(&mut self, words: Vec<Bytes>) -> Result<SendId, Violation> {
        if self.vocab_sent {
            return Err(Violation::new("vocabulary table already sent"));
        }
        self.vocab_sent = true;
        Ok(self.enqueue(Outgoing::Vocab(words)))
    }

    /// Whether nothing is queued, in progress, or suspended.
    pub(crate) fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.current.is_none()
    }

    /// Whether the pump is parked on an unresolved deferred.
    pub(crate) fn is_suspended(&self) -> bool {
        self.waiting.as_ref().is_some_and(|d| !d.is_resolved())
    }

    pub(crate) fn take_outgoing(&mut self) -> Option<Bytes> {
        self.writer.take()
    }

    pub(crate) fn pump(&mut self, host: &mut H, events: &mut Vec<BananaEvent>) {
        loop {
            if let Some(deferred) = &self.waiting {
                let Some(outcome) = deferred.peek() else {
                    return;
                };
                self.waiting = None;
                let result = outcome.and_then(|value| self.emit(value, host));
                if let Err(violation) = result {
                    self.abort(violation, events);
                }
                self.complete_if_done(events);
                continue;
            }

            let Some(frame) = self.stack.last_mut() else {
                let Some((id, item)) = self.queue.pop_front() else {
                    return;
                };
                self.current = Some(id);
                match item {
                    Outgoing::Vocab(words) => self.write_vocab(words),
                    Outgoing::Value(value) => {
                        if let Err(violation) = self.emit(value, host) {
                            self.abort(violation, events);
                        }
                    },
                }
                self.complete_if_done(events);
                continue;
            };

            match frame.slicer.next_child(host) {
                Ok(Some(child)) => {
                    if let Err(violation) = self.emit(child, host) {
                        self.abort(violation, events);
                    }
                },
                Ok(None) => {
                    if let Some(index) = self.stack.pop().and_then(|f| f.open) {
                        self.writer.close(index);
                    }
                },
                Err(violation) => self.abort(violation, events),
            }
            self.complete_if_done(events);
        }
    }

    /// Finish the current top-level send once nothing is left of it.
    fn complete_if_done(&mut self, events: &mut Vec<BananaEvent>) {
        if !self.stack.is_empty() || self.waiting.is_some() {
            return;
        }
        if let Some(id) = self.current.take() {
            events.push(BananaEvent::Sent(id));
            self.top_level_done();
        }
    }

    fn top_level_done(&mut self) {
        if self.scope == ReferenceScope::PerObject {
            self.next_open = 0;
            self.seen.clear();
        }
    }

    fn string(&mut self, body: &[u8]) {
        match self.vocab.get(body) {
            Some(&index) => self.writer.vocab(index),
            None => self.writer.string(body),
        }
    }

    fn open(&mut self, opentype: &str) -> u64 {
        let index = self.next_open;
        self.next_open += 1;
        self.writer.open(index);
        self.string(opentype.as_bytes());
        index
    }

    fn push(&mut self, slicer: Box<dyn Slicer<H>>, tracked: Option<(usize, Value)>) {
        let open = slicer.opentype().map(|opentype| self.open(opentype));
        if let (Some(index), Some((identity, value))) = (open, tracked) {
            self.seen.insert(identity, (index, value));
        }
        self.stack.push(SendFrame { slicer, open });
    }

    /// Write a primitive or push the slicer for a composite.
    fn emit(&mut self, value: Value, host: &mut H) -> Result<(), Violation> {
        if let Some(identity) = value.identity()
            && let Some(&(index, _)) = self.seen.get(&identity)
        {
            self.push(Box::new(FixedSlicer::reference(index)), None);
            return Ok(());
        }
        match value {
            Value::Int(v) => self.writer.int(v),
            Value::Float(v) => self.writer.float(v),
            Value::Bytes(ref b) => self.string(b),
            Value::None => self.push(Box::new(FixedSlicer::none()), None),
            Value::Bool(b) => self.push(Box::new(FixedSlicer::boolean(b)), None),
            Value::Text(ref s) => self.push(Box::new(FixedSlicer::unicode(s)), None),
            Value::List(ref list) => {
                let tracked = value.identity().map(|id| (id, value.clone()));
                self.push(Box::new(ListSlicer::new(list)), tracked);
            },
            Value::Tuple(ref tuple) => {
                let tracked = value.identity().map(|id| (id, value.clone()));
                self.push(Box::new(TupleSlicer::new(tuple)), tracked);
            },
            Value::Dict(ref dict) => {
                let tracked = value.identity().map(|id| (id, value.clone()));
                self.push(Box::new(DictSlicer::new(dict)), tracked);
            },
            Value::Object(ref object) => {
                let slicer = host.slice_object(object)?;
                self.push(slicer, None);
            },
            Value::Deferred(deferred) => match deferred.peek() {
                Some(outcome) => return self.emit(outcome?, host),
                None => {
                    debug!(depth = self.stack.len(), "send suspended on unresolved value");
                    self.waiting = Some(deferred);
                },
            },
        }
        Ok(())
    }

    /// Abort the innermost frame and offer the violation to its parent.
    ///
    /// Frames that refuse the violation are aborted in turn. A violation
    /// that escapes every frame aborts the top-level send.
    fn abort(&mut self, mut violation: Violation, events: &mut Vec<BananaEvent>) {
        self.waiting = None;
        loop {
            let Some(frame) = self.stack.pop() else {
                if let Some(id) = self.current.take() {
                    warn!(%violation, "send aborted");
                    events.push(BananaEvent::SendAborted { id, violation });
                    self.top_level_done();
                }
                return;
            };
            if let Some(index) = frame.open {
                self.writer.abort(index);
                self.writer.close(index);
            }
            let Some(parent) = self.stack.last_mut() else {
                continue;
            };
            match parent.slicer.child_aborted(violation) {
                Ok(()) => return,
                Err(escalated) => violation = escalated,
            }
        }
    }

    /// Write the vocabulary table uncompressed, then start using it.
    fn write_vocab(&mut self, words: Vec<Bytes>) {
        let index = self.next_open;
        self.next_open += 1;
        self.writer.open(index);
        self.writer.string(VOCAB_OPENTYPE.as_bytes());
        for (position, word) in words.iter().enumerate() {
            self.writer.int(position as i128);
            self.writer.string(word);
        }
        self.writer.close(index);
        self.vocab = words.into_iter().enumerate().map(|(i, w)| (w, i as u64)).collect();
        debug!(entries = self.vocab.len(), "installed outgoing vocabulary");
    }
}
