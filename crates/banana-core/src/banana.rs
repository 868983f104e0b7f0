//! The sans-IO codec.
//!
//! [`Banana`] owns both halves of a connection's serialization state and
//! the connection's [`Host`]. It performs no I/O: the driver feeds inbound
//! bytes to [`Banana::data_received`], calls [`Banana::pump`] to make
//! progress on queued sends, and writes whatever
//! [`Banana::take_outgoing`] returns.
//!
//! ```text
//!  send(value) ──> queue ──> pump() ──> slicer stack ──> take_outgoing()
//!                                                          │
//!                                                    transport
//!                                                          │
//!  events <── unslicer stack <── token parser <── data_received(bytes)
//! ```

use std::sync::Arc;

use banana_proto::{BananaError, UnbananaFailure, Violation};
use bytes::Bytes;
use tracing::error;

use crate::{
    config::BananaConfig,
    receive::{Env, Receiver},
    registry::Registry,
    send::Sender,
    slicer::Host,
    value::Value,
};

/// Handle for one top-level send, reported back in [`BananaEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SendId(pub u64);

/// Something the codec wants its owner to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum BananaEvent {
    /// A top-level object was decoded
    Received(Value),
    /// A top-level object was rejected and discarded
    Failure(UnbananaFailure),
    /// A top-level send was fully written
    Sent(SendId),
    /// A top-level send was aborted; ABORT/CLOSE were written for any
    /// object already opened
    SendAborted {
        /// Which send
        id: SendId,
        /// Why
        violation: Violation,
    },
}

/// One connection's codec state.
pub struct Banana<H: Host> {
    config: BananaConfig,
    registry: Arc<Registry<H>>,
    host: H,
    sender: Sender<H>,
    receiver: Receiver<H>,
    failed: Option<BananaError>,
}

impl<H: Host> Banana<H> {
    /// Create a codec for a fresh connection.
    pub fn new(config: BananaConfig, registry: Arc<Registry<H>>, host: H) -> Self {
        let sender = Sender::new(config.reference_scope);
        Self { config, registry, host, sender, receiver: Receiver::new(), failed: None }
    }

    /// The codec's configuration.
    pub fn config(&self) -> &BananaConfig {
        &self.config
    }

    /// Connection-specific host state.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Mutable host state.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Queue a top-level value. Nothing is written until [`Banana::pump`].
    pub fn send(&mut self, value: Value) -> SendId {
        self.sender.send(value)
    }

    /// Queue the vocabulary table. Strings queued after it are abbreviated.
    ///
    /// # Errors
    ///
    /// A connection sends at most one table.
    pub fn send_vocabulary(
        &mut self,
        words: impl IntoIterator<Item = Bytes>,
    ) -> Result<SendId, Violation> {
        self.sender.send_vocabulary(words.into_iter().collect())
    }

    /// Serialize as much of the send queue as possible.
    ///
    /// Stops when the queue is empty or a send is parked on an unresolved
    /// [`crate::Deferred`].
    pub fn pump(&mut self) -> Vec<BananaEvent> {
        let mut events = Vec::new();
        self.sender.pump(&mut self.host, &mut events);
        events
    }

    /// Whether every queued send has been written.
    pub fn is_idle(&self) -> bool {
        self.sender.is_idle()
    }

    /// Whether the pump is waiting on an unresolved deferred.
    pub fn is_suspended(&self) -> bool {
        self.sender.is_suspended()
    }

    /// Bytes ready for the transport.
    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        self.sender.take_outgoing()
    }

    /// Feed bytes from the transport.
    ///
    /// # Errors
    ///
    /// A [`BananaError`] means the stream is unrecoverable; the connection
    /// must be dropped. Every later call returns the same error.
    pub fn data_received(&mut self, data: &[u8]) -> Result<Vec<BananaEvent>, BananaError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let mut events = Vec::new();
        let mut env = Env {
            config: &self.config,
            registry: &self.registry,
            host: &mut self.host,
            events: &mut events,
        };
        match self.receiver.data_received(data, &mut env) {
            Ok(()) => Ok(events),
            Err(err) => {
                error!(
                    %err,
                    buffered = self.receiver.buffered(),
                    depth = self.receiver.depth(),
                    "fatal banana error"
                );
                self.failed = Some(err.clone());
                Err(err)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use banana_proto::TokenType;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        config::ReferenceScope,
        constraint::Constraint,
        value::{Deferred, Key, List},
    };

    fn codec() -> Banana<()> {
        Banana::new(BananaConfig::default(), Arc::new(Registry::new()), ())
    }

    fn codec_with(config: BananaConfig) -> Banana<()> {
        Banana::new(config, Arc::new(Registry::new()), ())
    }

    fn encode(codec: &mut Banana<()>, value: Value) -> Vec<u8> {
        codec.send(value);
        codec.pump();
        codec.take_outgoing().map(|b| b.to_vec()).unwrap_or_default()
    }

    fn decode_all(codec: &mut Banana<()>, bytes: &[u8]) -> Vec<BananaEvent> {
        codec.data_received(bytes).unwrap()
    }

    fn roundtrip(value: Value) -> Value {
        let bytes = encode(&mut codec(), value);
        match decode_all(&mut codec(), &bytes).as_slice() {
            [BananaEvent::Received(v)] => v.clone(),
            other => panic!("unexpected events {other:?}"),
        }
    }

    fn sample() -> Value {
        Value::list([
            Value::Int(1),
            Value::Int(-(1 << 31)),
            Value::Int(1 << 40),
            Value::Int(-(1 << 40)),
            Value::Float(2.5),
            Value::from("héllo"),
            Value::bytes("raw"),
            Value::None,
            Value::Bool(true),
            Value::tuple([Value::Int(1), Value::dict([(Key::from("k"), Value::list([]))])]),
        ])
    }

    #[test]
    fn primitives_roundtrip() {
        for value in [
            Value::Int(0),
            Value::Int((1 << 31) - 1),
            Value::Int(1 << 31),
            Value::Int(-(1 << 31)),
            Value::Int(-(1 << 31) - 1),
            Value::Int(i128::MAX),
            Value::Int(i128::MIN),
            Value::Float(-0.125),
            Value::Bool(false),
            Value::None,
            Value::from("text"),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn nested_structure_roundtrips() {
        assert_eq!(roundtrip(sample()), sample());
    }

    #[test]
    fn list_wire_format() {
        let bytes = encode(&mut codec(), Value::list([Value::Int(1)]));
        // OPEN(0) "list" INT(1) CLOSE(0)
        assert_eq!(hex::encode(bytes), "008804826c69737401810089");
    }

    #[test]
    fn shared_list_is_sent_once() {
        let shared = Value::list([Value::Int(1), Value::Int(2)]);
        let outer = Value::list([shared.clone(), shared]);
        let bytes = encode(&mut codec(), outer);
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("list").count(), 2);
        assert_eq!(text.matches("reference").count(), 1);

        let events = decode_all(&mut codec(), &bytes);
        let [BananaEvent::Received(Value::List(decoded))] = &events[..] else {
            panic!("expected one list");
        };
        let (Some(Value::List(a)), Some(Value::List(b))) = (decoded.get(0), decoded.get(1)) else {
            panic!("expected two lists");
        };
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn self_reference_roundtrips() {
        let list = List::new(vec![Value::Int(7)]);
        list.push(Value::List(list.clone()));
        let bytes = encode(&mut codec(), Value::List(list));
        let events = decode_all(&mut codec(), &bytes);
        let [BananaEvent::Received(Value::List(decoded))] = &events[..] else {
            panic!("expected one list");
        };
        let Some(Value::List(inner)) = decoded.get(1) else {
            panic!("expected a nested list");
        };
        assert!(inner.ptr_eq(decoded));
    }

    #[test]
    fn vocabulary_shortens_repeated_strings() {
        let mut sender = codec();
        sender.send_vocabulary([Bytes::from_static(b"remote_add")]).unwrap();
        assert!(sender.send_vocabulary([Bytes::from_static(b"x")]).is_err());
        sender.send(Value::bytes("remote_add"));
        sender.send(Value::bytes("remote_add"));
        sender.pump();
        let bytes = sender.take_outgoing().unwrap();

        let plain = encode(&mut codec(), Value::bytes("remote_add"));
        let vocab_token = [0x00, TokenType::Vocab.to_byte()];
        assert!(vocab_token.len() < plain.len());
        assert!(bytes.ends_with(&[vocab_token, vocab_token].concat()));

        let events = decode_all(&mut codec(), &bytes);
        assert_eq!(
            events,
            vec![
                BananaEvent::Received(Value::bytes("remote_add")),
                BananaEvent::Received(Value::bytes("remote_add")),
            ]
        );
    }

    #[test]
    fn violation_discards_rest_of_list_and_recovers() {
        let config = BananaConfig {
            root_constraint: Some(Constraint::list_of(Constraint::bytes(), 10)),
            ..BananaConfig::default()
        };
        let mut sender = codec();
        let bad = Value::list([Value::bytes("ok"), Value::Int(5), Value::bytes("after")]);
        let good = Value::list([Value::bytes("fine")]);
        let mut bytes = encode(&mut sender, bad);
        bytes.extend(encode(&mut sender, good.clone()));

        let mut receiver = codec_with(config);
        let events = decode_all(&mut receiver, &bytes);
        assert_eq!(events.len(), 2);
        let BananaEvent::Failure(failure) = &events[0] else {
            panic!("expected a failure first");
        };
        assert_eq!(failure.violation.location(), Some("root.list"));
        assert_eq!(events[1], BananaEvent::Received(good));
    }

    #[test]
    fn oversized_string_skipped_without_buffering() {
        let config = BananaConfig { max_string_length: 8, ..BananaConfig::default() };
        let mut receiver = codec_with(config);
        let mut bytes = encode(&mut codec(), Value::bytes(vec![b'x'; 100]));
        // the header alone triggers rejection
        let events = decode_all(&mut receiver, &bytes[..3]);
        assert!(matches!(events.as_slice(), [BananaEvent::Failure(_)]));
        bytes.extend(encode(&mut codec(), Value::Int(3)));
        let events = decode_all(&mut receiver, &bytes[3..]);
        assert_eq!(events, vec![BananaEvent::Received(Value::Int(3))]);
    }

    #[test]
    fn open_index_limit_is_fatal() {
        let config = BananaConfig { max_open_index: 4, ..BananaConfig::default() };
        let mut receiver = codec_with(config);
        let mut bytes = Vec::new();
        banana_proto::encode_header(5, &mut bytes);
        bytes.push(TokenType::Open.to_byte());
        assert!(matches!(
            receiver.data_received(&bytes),
            Err(BananaError::OpenIndexTooLarge { index: 5, limit: 4 })
        ));
        assert!(receiver.data_received(&[]).is_err());
    }

    #[test]
    fn overlong_header_is_fatal() {
        let mut receiver = codec();
        assert!(matches!(
            receiver.data_received(&[0x01; 65]),
            Err(BananaError::HeaderTooLong { .. })
        ));
    }

    #[test]
    fn oversized_long_integer_skipped_in_small_reads() {
        for kind in [TokenType::LongInt, TokenType::LongNeg] {
            let mut bytes = vec![0x11, kind.to_byte()];
            bytes.extend_from_slice(&[0xff; 17]);
            bytes.extend(encode(&mut codec(), Value::Int(5)));

            let mut receiver = codec();
            let mut events = Vec::new();
            for chunk in bytes.chunks(2) {
                events.extend(decode_all(&mut receiver, chunk));
            }
            assert_eq!(events.len(), 2);
            let BananaEvent::Failure(failure) = &events[0] else {
                panic!("expected a failure first");
            };
            assert!(failure.violation.message().contains("17 bytes"));
            assert_eq!(events[1], BananaEvent::Received(Value::Int(5)));
        }
    }

    #[test]
    fn nesting_beyond_depth_limit_is_skipped() {
        let depth: u64 = 100_000;
        let mut bytes = Vec::new();
        for index in 0..depth {
            banana_proto::encode_header(index, &mut bytes);
            bytes.extend_from_slice(&[TokenType::Open.to_byte(), 0x04, TokenType::String.to_byte()]);
            bytes.extend_from_slice(b"list");
        }
        for index in (0..depth).rev() {
            banana_proto::encode_header(index, &mut bytes);
            bytes.push(TokenType::Close.to_byte());
        }
        bytes.extend(encode(&mut codec(), Value::Int(9)));

        let events = decode_all(&mut codec(), &bytes);
        assert_eq!(events.len(), 2);
        let BananaEvent::Failure(failure) = &events[0] else {
            panic!("expected a failure first");
        };
        assert!(failure.violation.message().contains("nested deeper than 256"));
        assert_eq!(events[1], BananaEvent::Received(Value::Int(9)));
    }

    #[test]
    fn skipped_objects_are_reported_to_the_host() {
        #[derive(Default)]
        struct Skips(Vec<(Vec<u8>, u64)>);
        impl Host for Skips {
            fn skipped(&mut self, opentype: &[u8], first: u64) {
                self.0.push((opentype.to_vec(), first));
            }
        }

        let config = BananaConfig {
            root_constraint: Some(Constraint::list_of(Constraint::bytes(), 10)),
            ..BananaConfig::default()
        };
        let bytes = encode(
            &mut codec(),
            Value::list([Value::bytes("ok"), Value::tuple([Value::Int(9), Value::Int(10)])]),
        );
        let mut receiver = Banana::new(config, Arc::new(Registry::new()), Skips::default());
        let events = receiver.data_received(&bytes).unwrap();
        assert!(matches!(events.as_slice(), [BananaEvent::Failure(_)]));
        assert_eq!(receiver.host().0, vec![(b"tuple".to_vec(), 9)]);
    }

    #[test]
    fn legacy_list_is_fatal() {
        assert_eq!(codec().data_received(&[0x00, 0x80]), Err(BananaError::LegacyList));
    }

    #[test]
    fn close_mismatch_is_fatal() {
        let bytes = [0x00, 0x88, 0x04, 0x82, b'l', b'i', b's', b't', 0x01, 0x89];
        assert!(matches!(
            codec().data_received(&bytes),
            Err(BananaError::IndexMismatch { token: "CLOSE", expected: 0, got: 1 })
        ));
    }

    #[test]
    fn unknown_opentype_is_recoverable() {
        let mut bytes = vec![0x00, 0x88, 0x05, 0x82];
        bytes.extend_from_slice(b"bogus");
        bytes.extend_from_slice(&[0x01, 0x81, 0x00, 0x89]);
        bytes.extend(encode(&mut codec(), Value::Int(9)));
        let events = decode_all(&mut codec(), &bytes);
        assert!(matches!(events[0], BananaEvent::Failure(_)));
        assert_eq!(events[1], BananaEvent::Received(Value::Int(9)));
    }

    #[test]
    fn sender_abort_is_delivered_as_failure() {
        #[derive(Debug)]
        struct Unsendable;
        impl crate::value::Object for Unsendable {
            fn type_name(&self) -> &'static str {
                "Unsendable"
            }
            fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
                self
            }
        }

        let mut sender = codec();
        let bad = Value::list([
            Value::Int(1),
            Value::Object(crate::value::ObjectRef::new(Arc::new(Unsendable))),
        ]);
        let id = sender.send(bad);
        let next = sender.send(Value::Int(2));
        let events = sender.pump();
        assert!(matches!(&events[0], BananaEvent::SendAborted { id: aborted, .. } if *aborted == id));
        assert_eq!(events[1], BananaEvent::Sent(next));
        let bytes = sender.take_outgoing().unwrap();

        let events = decode_all(&mut codec(), &bytes);
        assert!(matches!(events[0], BananaEvent::Failure(_)));
        assert_eq!(events[1], BananaEvent::Received(Value::Int(2)));
    }

    #[test]
    fn deferred_suspends_without_blocking_queue_order() {
        let mut sender = codec();
        let later = Deferred::new();
        let first = sender.send(Value::list([Value::Int(1), Value::Deferred(later.clone())]));
        let second = sender.send(Value::Int(2));
        assert!(sender.pump().is_empty());
        assert!(sender.is_suspended());

        later.resolve(Value::from("done"));
        assert_eq!(sender.pump(), vec![BananaEvent::Sent(first), BananaEvent::Sent(second)]);
        let bytes = sender.take_outgoing().unwrap();
        assert_eq!(
            decode_all(&mut codec(), &bytes),
            vec![
                BananaEvent::Received(Value::list([Value::Int(1), Value::from("done")])),
                BananaEvent::Received(Value::Int(2)),
            ]
        );
    }

    #[test]
    fn failed_deferred_aborts_enclosing_object() {
        let mut sender = codec();
        let later = Deferred::new();
        let id = sender.send(Value::list([Value::Deferred(later.clone())]));
        sender.pump();
        later.fail(Violation::new("lookup failed"));
        let events = sender.pump();
        assert!(matches!(&events[..], [BananaEvent::SendAborted { id: aborted, .. }] if *aborted == id));
    }

    #[test]
    fn connection_scope_keeps_references_across_objects() {
        let config = BananaConfig { reference_scope: ReferenceScope::Connection, ..BananaConfig::default() };
        let mut sender = codec_with(config.clone());
        let shared = Value::list([Value::Int(1)]);
        let mut bytes = encode(&mut sender, shared.clone());
        bytes.extend(encode(&mut sender, shared));

        let events = decode_all(&mut codec_with(config), &bytes);
        let [BananaEvent::Received(Value::List(a)), BananaEvent::Received(Value::List(b))] = &events[..]
        else {
            panic!("expected two lists");
        };
        assert!(a.ptr_eq(b));
    }

    #[test]
    fn per_object_scope_restarts_counter() {
        let mut sender = codec();
        let first = encode(&mut sender, Value::list([]));
        let second = encode(&mut sender, Value::list([]));
        assert_eq!(first, second);
    }

    #[test]
    fn dict_with_list_key_is_rejected() {
        // OPEN(0) "dict" OPEN(1) "list" CLOSE(1) INT(1) CLOSE(0)
        let mut bytes = vec![0x00, 0x88, 0x04, 0x82];
        bytes.extend_from_slice(b"dict");
        bytes.extend_from_slice(&[0x01, 0x88, 0x04, 0x82]);
        bytes.extend_from_slice(b"list");
        bytes.extend_from_slice(&[0x01, 0x89, 0x01, 0x81, 0x00, 0x89]);
        let events = decode_all(&mut codec(), &bytes);
        assert!(matches!(events.as_slice(), [BananaEvent::Failure(_)]));
    }

    proptest! {
        #[test]
        fn split_at_every_boundary(split in 0usize..200) {
            let bytes = encode(&mut codec(), sample());
            let split = split.min(bytes.len());
            let mut receiver = codec();
            let mut events = receiver.data_received(&bytes[..split]).unwrap();
            events.extend(receiver.data_received(&bytes[split..]).unwrap());
            prop_assert_eq!(events, vec![BananaEvent::Received(sample())]);
        }

        #[test]
        fn integers_roundtrip(v in any::<i128>()) {
            prop_assert_eq!(roundtrip(Value::Int(v)), Value::Int(v));
        }
    }

    #[test]
    fn one_byte_at_a_time() {
        let bytes = encode(&mut codec(), sample());
        let mut receiver = codec();
        let mut events = Vec::new();
        for byte in &bytes {
            events.extend(receiver.data_received(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(events, vec![BananaEvent::Received(sample())]);
    }
}
