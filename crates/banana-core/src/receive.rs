//! Inbound half of the codec: token parser plus unslicer stack.
//!
//! The parser works on whatever has been buffered and never assumes a token
//! lines up with a read boundary. Each pass either consumes one token or
//! reports that more bytes are needed.
//!
//! # Discarding
//!
//! A rejected subtree is consumed silently. `discard` counts the CLOSE
//! tokens still owed by abandoned objects: every OPEN seen while discarding
//! adds one, every CLOSE removes one, bodies are skipped. Once it drops back
//! to zero the parser is aligned with the sender again.
//!
//! Discarded objects are still scanned for their opentype and leading INT,
//! which the host sees through [`Host::skipped`].

use std::{collections::HashMap, mem};

use banana_proto::{
    BananaError, MAX_LONG_BODY, TokenType, UnbananaFailure, Violation, decode_header,
    find_type_byte,
    number::{magnitude_from_bytes, signed},
};
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::{
    banana::BananaEvent,
    config::{BananaConfig, ReferenceScope},
    registry::{Registry, VOCAB_OPENTYPE},
    slicer::Host,
    unslicer::{Context, References, Unslicer},
    value::{Key, Value},
};

struct Frame<H> {
    unslicer: Box<dyn Unslicer<H>>,
    count: u64,
    opentype: String,
}

/// OPEN whose index tokens are still arriving.
struct Opening {
    count: u64,
    index: Vec<Bytes>,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenType,
    header: u64,
    /// Header digits plus the type byte
    prefix: usize,
}

/// How much of the object being discarded has been seen.
enum Scan {
    Idle,
    /// An OPEN; the next token names the opentype
    Opened,
    /// The opentype; an INT that follows is its first child
    Named(Bytes),
}

/// Borrowed surroundings for one `data_received` pass.
pub(crate) struct Env<'a, H> {
    pub(crate) config: &'a BananaConfig,
    pub(crate) registry: &'a Registry<H>,
    pub(crate) host: &'a mut H,
    pub(crate) events: &'a mut Vec<BananaEvent>,
}

pub(crate) struct Receiver<H> {
    buffer: BytesMut,
    skip_bytes: u64,
    discard: u64,
    scan: Scan,
    opening: Option<Opening>,
    stack: Vec<Frame<H>>,
    references: References,
    vocab: HashMap<u64, Bytes>,
}

fn location<H>(stack: &[Frame<H>], extra: Option<&str>) -> String {
    let mut path = String::from("root");
    for name in stack.iter().map(|f| f.opentype.as_str()).chain(extra) {
        path.push('.');
        path.push_str(name);
    }
    path
}

impl<H: Host> Receiver<H> {
    pub(crate) fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            skip_bytes: 0,
            discard: 0,
            scan: Scan::Idle,
            opening: None,
            stack: Vec::new(),
            references: References::default(),
            vocab: HashMap::new(),
        }
    }

    /// Bytes buffered but not yet consumed.
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Depth of the unslicer stack, excluding the root.
    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn data_received(&mut self, data: &[u8], env: &mut Env<'_, H>) -> Result<(), BananaError> {
        self.buffer.extend_from_slice(data);
        while self.step(env)? {}
        Ok(())
    }

    /// Consume one token. `Ok(false)` means more bytes are needed.
    fn step(&mut self, env: &mut Env<'_, H>) -> Result<bool, BananaError> {
        if self.skip_bytes > 0 {
            let available = self.buffer.len().min(usize::try_from(self.skip_bytes).unwrap_or(usize::MAX));
            self.buffer.advance(available);
            self.skip_bytes -= available as u64;
            if self.skip_bytes > 0 {
                return Ok(false);
            }
        }

        let Some(position) = find_type_byte(&self.buffer)? else {
            return Ok(false);
        };
        let header = decode_header(&self.buffer[..position])?;
        let kind = TokenType::from_byte(self.buffer[position])?;
        if kind == TokenType::List {
            return Err(BananaError::LegacyList);
        }
        let token = Token { kind, header, prefix: position + 1 };
        trace!(token = kind.name(), header, "token");

        if self.discard > 0 {
            return Ok(self.discard_token(token, env));
        }
        if self.opening.is_some() {
            return self.index_token(token, env);
        }
        match kind {
            TokenType::Open => self.open_token(token, env),
            TokenType::Close => self.close_token(token, env),
            TokenType::Abort => self.abort_token(token, env),
            _ => Ok(self.value_token(token, env)),
        }
    }

    fn body_length(token: Token) -> u64 {
        match token.kind {
            TokenType::String | TokenType::LongInt | TokenType::LongNeg => token.header,
            TokenType::Float => 8,
            _ => 0,
        }
    }

    /// Drop the token prefix and schedule its body to be skipped.
    fn skip_token(&mut self, token: Token) {
        self.buffer.advance(token.prefix);
        self.skip_bytes = Self::body_length(token);
    }

    /// Whole body, if buffered. Consumes prefix and body.
    fn take_body(&mut self, token: Token) -> Option<Bytes> {
        let length = usize::try_from(Self::body_length(token)).ok()?;
        if self.buffer.len() < token.prefix + length {
            return None;
        }
        self.buffer.advance(token.prefix);
        Some(self.buffer.split_to(length).freeze())
    }

    /// Skip one token of a rejected subtree. `false` means more bytes are
    /// needed.
    fn discard_token(&mut self, token: Token, env: &mut Env<'_, H>) -> bool {
        match (token.kind, mem::replace(&mut self.scan, Scan::Idle)) {
            (TokenType::String, Scan::Opened) if token.header <= env.config.max_index_length as u64 => {
                let Some(word) = self.take_body(token) else {
                    self.scan = Scan::Opened;
                    return false;
                };
                self.scan = Scan::Named(word);
                return true;
            },
            (TokenType::Vocab, Scan::Opened) => {
                if let Some(word) = self.vocab.get(&token.header) {
                    self.scan = Scan::Named(word.clone());
                }
            },
            (TokenType::Int, Scan::Named(opentype)) => {
                trace!(opentype = %String::from_utf8_lossy(&opentype), first = token.header, "skipped object");
                env.host.skipped(&opentype, token.header);
            },
            _ => {},
        }

        self.skip_token(token);
        match token.kind {
            TokenType::Open => {
                self.discard += 1;
                self.scan = Scan::Opened;
            },
            TokenType::Close => {
                self.discard -= 1;
                if self.discard == 0 {
                    debug!(depth = self.stack.len(), "discard complete");
                    self.scan = Scan::Idle;
                    if self.stack.is_empty() {
                        self.top_level_done(env.config.reference_scope);
                    }
                }
            },
            _ => {},
        }
        true
    }

    fn index_token(&mut self, token: Token, env: &mut Env<'_, H>) -> Result<bool, BananaError> {
        let word = match token.kind {
            TokenType::String => {
                if token.header > env.config.max_index_length as u64 {
                    return Err(BananaError::IndexTooLong {
                        length: token.header,
                        limit: env.config.max_index_length,
                    });
                }
                match self.take_body(token) {
                    Some(body) => body,
                    None => return Ok(false),
                }
            },
            TokenType::Vocab => {
                let word = self
                    .vocab
                    .get(&token.header)
                    .cloned()
                    .ok_or(BananaError::UnknownIndexVocab(token.header))?;
                self.buffer.advance(token.prefix);
                word
            },
            TokenType::Open => return Err(BananaError::OpenDuringIndex),
            TokenType::Abort => {
                let Some(opening) = self.opening.take() else {
                    return Ok(true);
                };
                if opening.count != token.header {
                    return Err(BananaError::IndexMismatch {
                        token: "ABORT",
                        expected: opening.count,
                        got: token.header,
                    });
                }
                self.buffer.advance(token.prefix);
                self.discard += 1;
                let violation = Violation::new("sender aborted the object").at(location(&self.stack, None));
                self.deliver(Err(UnbananaFailure::new(violation)), env);
                return Ok(true);
            },
            other => return Err(BananaError::BadIndexToken(other.name())),
        };

        let Some(opening) = self.opening.as_mut() else {
            return Ok(true);
        };
        opening.index.push(word);
        let index = opening.index.clone();
        let count = opening.count;

        let mut cx =
            Context { host: &mut *env.host, references: &mut self.references, registry: env.registry };
        let opened = match self.stack.last_mut() {
            Some(parent) => parent.unslicer.do_open(&index, &mut cx),
            None => env.registry.open_top_level(&index, env.config.root_constraint.as_ref()),
        };

        match opened {
            Ok(None) => {},
            Ok(Some(child)) => {
                self.opening = None;
                let opentype = String::from_utf8_lossy(&index[0]).into_owned();
                self.push_frame(Frame { unslicer: child, count, opentype }, env);
            },
            Err(violation) => {
                self.opening = None;
                self.discard += 1;
                self.scan = index.first().cloned().map_or(Scan::Idle, Scan::Named);
                let violation = violation.at(location(&self.stack, None));
                self.deliver(Err(UnbananaFailure::new(violation)), env);
            },
        }
        Ok(true)
    }

    fn push_frame(&mut self, mut frame: Frame<H>, env: &mut Env<'_, H>) {
        let mut cx =
            Context { host: &mut *env.host, references: &mut self.references, registry: env.registry };
        match frame.unslicer.start(frame.count, &mut cx) {
            Ok(()) => self.stack.push(frame),
            Err(violation) => {
                let violation = violation.at(location(&self.stack, Some(frame.opentype.as_str())));
                frame.unslicer.abandoned(&violation, &mut cx);
                frame.unslicer.finish(&mut cx);
                self.discard += 1;
                self.scan = Scan::Named(Bytes::from(frame.opentype.into_bytes()));
                self.deliver(Err(UnbananaFailure::new(violation)), env);
            },
        }
    }

    /// Ask the innermost frame (or the root constraint) about a token.
    fn check_token(&self, token: Token, env: &Env<'_, H>) -> Result<(), Violation> {
        match self.stack.last() {
            Some(frame) => frame.unslicer.check_token(token.kind, token.header),
            None => env
                .config
                .root_constraint
                .as_ref()
                .map_or(Ok(()), |c| c.check_token(token.kind, token.header)),
        }
    }

    fn open_token(&mut self, token: Token, env: &mut Env<'_, H>) -> Result<bool, BananaError> {
        if token.header > env.config.max_open_index {
            return Err(BananaError::OpenIndexTooLarge {
                index: token.header,
                limit: env.config.max_open_index,
            });
        }
        self.buffer.advance(token.prefix);
        let checked = if self.stack.len() >= env.config.max_depth {
            Err(Violation::new(format!("objects nested deeper than {}", env.config.max_depth)))
        } else {
            self.check_token(token, env)
        };
        match checked {
            Ok(()) => self.opening = Some(Opening { count: token.header, index: Vec::new() }),
            Err(violation) => {
                self.discard += 1;
                self.scan = Scan::Opened;
                let violation = violation.at(location(&self.stack, None));
                self.deliver(Err(UnbananaFailure::new(violation)), env);
            },
        }
        Ok(true)
    }

    fn close_token(&mut self, token: Token, env: &mut Env<'_, H>) -> Result<bool, BananaError> {
        let Some(mut frame) = self.stack.pop() else {
            return Err(BananaError::NothingOpen { token: "CLOSE" });
        };
        if frame.count != token.header {
            return Err(BananaError::IndexMismatch {
                token: "CLOSE",
                expected: frame.count,
                got: token.header,
            });
        }
        self.buffer.advance(token.prefix);

        let mut cx =
            Context { host: &mut *env.host, references: &mut self.references, registry: env.registry };
        let result = frame
            .unslicer
            .receive_close(&mut cx)
            .map_err(|v| v.at(location(&self.stack, Some(frame.opentype.as_str()))));
        if let Err(violation) = &result {
            frame.unslicer.abandoned(violation, &mut cx);
        }
        frame.unslicer.finish(&mut cx);

        if self.stack.is_empty() && frame.opentype == VOCAB_OPENTYPE {
            match result {
                Ok(table) => self.install_vocab(&table),
                Err(violation) => {
                    warn!(%violation, "rejected vocabulary table");
                    env.events.push(BananaEvent::Failure(UnbananaFailure::new(violation)));
                },
            }
            self.top_level_done(env.config.reference_scope);
            return Ok(true);
        }
        self.deliver(result.map_err(UnbananaFailure::new), env);
        Ok(true)
    }

    fn abort_token(&mut self, token: Token, env: &mut Env<'_, H>) -> Result<bool, BananaError> {
        let Some(mut frame) = self.stack.pop() else {
            return Err(BananaError::NothingOpen { token: "ABORT" });
        };
        if frame.count != token.header {
            return Err(BananaError::IndexMismatch {
                token: "ABORT",
                expected: frame.count,
                got: token.header,
            });
        }
        self.buffer.advance(token.prefix);
        let violation = Violation::new("sender aborted the object")
            .at(location(&self.stack, Some(frame.opentype.as_str())));
        debug!(%violation, "ABORT received");

        let mut cx =
            Context { host: &mut *env.host, references: &mut self.references, registry: env.registry };
        frame.unslicer.abandoned(&violation, &mut cx);
        frame.unslicer.finish(&mut cx);
        // the CLOSE that follows every ABORT
        self.discard += 1;
        self.deliver(Err(UnbananaFailure::new(violation)), env);
        Ok(true)
    }

    /// INT, NEG, LONGINT, LONGNEG, FLOAT, STRING, VOCAB.
    fn value_token(&mut self, token: Token, env: &mut Env<'_, H>) -> bool {
        if let Err(violation) = self.limit_token(token, env.config).and_then(|()| self.check_token(token, env))
        {
            self.skip_token(token);
            let violation = violation.at(location(&self.stack, None));
            self.deliver(Err(UnbananaFailure::new(violation)), env);
            return true;
        }

        let value = match token.kind {
            TokenType::Int => {
                self.buffer.advance(token.prefix);
                Ok(Value::Int(i128::from(token.header)))
            },
            TokenType::Neg => {
                self.buffer.advance(token.prefix);
                Ok(Value::Int(-i128::from(token.header)))
            },
            TokenType::Vocab => {
                self.buffer.advance(token.prefix);
                self.vocab
                    .get(&token.header)
                    .cloned()
                    .map(Value::Bytes)
                    .ok_or_else(|| Violation::new(format!("unknown vocabulary entry {}", token.header)))
            },
            TokenType::String => match self.take_body(token) {
                Some(body) => Ok(Value::Bytes(body)),
                None => return false,
            },
            TokenType::Float => match self.take_body(token) {
                Some(mut body) => Ok(Value::Float(body.get_f64())),
                None => return false,
            },
            TokenType::LongInt | TokenType::LongNeg => match self.take_body(token) {
                Some(body) => magnitude_from_bytes(&body)
                    .and_then(|m| signed(m, token.kind == TokenType::LongNeg))
                    .map(Value::Int),
                None => return false,
            },
            TokenType::List | TokenType::Open | TokenType::Close | TokenType::Abort => {
                Err(Violation::new(format!("unexpected {}", token.kind.name())))
            },
        };
        let value = value.map_err(|v| UnbananaFailure::new(v.at(location(&self.stack, None))));
        self.deliver(value, env);
        true
    }

    /// Limits that hold regardless of the active constraint.
    fn limit_token(&self, token: Token, config: &BananaConfig) -> Result<(), Violation> {
        match token.kind {
            TokenType::String if token.header > config.max_string_length as u64 => Err(Violation::new(
                format!("string of {} bytes exceeds {}", token.header, config.max_string_length),
            )),
            TokenType::LongInt | TokenType::LongNeg if token.header > MAX_LONG_BODY as u64 => {
                Err(Violation::new(format!(
                    "long integer of {} bytes exceeds {MAX_LONG_BODY}",
                    token.header
                )))
            },
            _ => Ok(()),
        }
    }

    /// Hand a finished child (or its failure) to the innermost frame.
    ///
    /// A frame that refuses the child is abandoned and the failure moves up
    /// one level, until some frame absorbs it or it reaches the root.
    fn deliver(&mut self, mut outcome: Result<Value, UnbananaFailure>, env: &mut Env<'_, H>) {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.deliver_to_root(outcome, env);
                return;
            };
            let mut cx =
                Context { host: &mut *env.host, references: &mut self.references, registry: env.registry };
            let Err(violation) = frame.unslicer.receive_child(outcome, &mut cx) else {
                return;
            };
            let violation = violation.at(location(&self.stack, None));
            if let Some(mut frame) = self.stack.pop() {
                let mut cx = Context {
                    host: &mut *env.host,
                    references: &mut self.references,
                    registry: env.registry,
                };
                frame.unslicer.abandoned(&violation, &mut cx);
                frame.unslicer.finish(&mut cx);
                debug!(%violation, opentype = %frame.opentype, "unslicer abandoned");
            }
            self.discard += 1;
            outcome = Err(UnbananaFailure::new(violation));
        }
    }

    fn deliver_to_root(&mut self, outcome: Result<Value, UnbananaFailure>, env: &mut Env<'_, H>) {
        match outcome {
            Ok(value) => env.events.push(BananaEvent::Received(value)),
            Err(failure) => {
                warn!(violation = %failure.violation, "top-level object rejected");
                env.events.push(BananaEvent::Failure(failure));
            },
        }
        if self.discard == 0 {
            self.top_level_done(env.config.reference_scope);
        }
    }

    fn top_level_done(&mut self, scope: ReferenceScope) {
        if scope == ReferenceScope::PerObject {
            self.references.clear();
        }
    }

    fn install_vocab(&mut self, table: &Value) {
        let Value::Dict(entries) = table else {
            return;
        };
        self.vocab = entries
            .snapshot()
            .into_iter()
            .filter_map(|(key, word)| match (key, word) {
                (Key::Int(index), Value::Bytes(word)) => Some((u64::try_from(index).ok()?, word)),
                _ => None,
            })
            .collect();
        debug!(entries = self.vocab.len(), "installed incoming vocabulary");
    }
}
