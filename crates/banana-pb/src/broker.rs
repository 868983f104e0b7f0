//! The per-connection broker.
//!
//! A [`Broker`] is a sans-IO state machine: the caller feeds it transport
//! bytes with [`Broker::data_received`] and writes out whatever
//! [`BrokerAction`]s come back. Outbound calls return a [`RemoteCall`]
//! future immediately; the `call` itself is written on the next
//! [`Broker::flush`]. Awaiting one call never blocks the connection, so any
//! number of calls can be in flight at once.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use banana_core::{Banana, BananaConfig, BananaEvent, Constraint, Deferred, SendId, Value, Violation};
use bytes::Bytes;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::{
    error::CallError,
    failure::Failure,
    messages::{self, Message},
    reference::RemoteReference,
    referenceable::Referenceable,
    schema::{CallArgs, InterfaceRegistry},
    state::{BrokerState, Outcome, PendingRequest},
};

/// Name under which the root object is published.
pub const ROOT_NAME: &str = "root";

/// Broker configuration.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Codec limits. A missing root constraint defaults to the broker's
    /// four top-level message opentypes.
    pub banana: BananaConfig,
    /// Include traceback text in `error` responses
    pub unsafe_tracebacks: bool,
    /// Interfaces known to this process
    pub interfaces: Arc<InterfaceRegistry>,
}

/// I/O the owner of a broker must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAction {
    /// Write these bytes to the transport
    Write(Bytes),
    /// Close the transport; the stream is unrecoverable
    LoseConnection {
        /// Why
        reason: String,
    },
}

enum Purpose {
    Call(u64),
    Answer(u64),
}

struct HeldAnswer {
    req_id: u64,
    deferred: Deferred,
    result: Option<Constraint>,
}

/// One side of a PB connection.
pub struct Broker {
    banana: Banana<BrokerState>,
    purposes: HashMap<SendId, Purpose>,
    held: Vec<HeldAnswer>,
    next_req_id: u64,
    connected: bool,
}

impl Broker {
    /// Create a broker for a fresh connection, publishing `root`.
    pub fn new(config: BrokerConfig, root: Arc<dyn Referenceable>) -> Self {
        let mut banana_config = config.banana;
        if banana_config.root_constraint.is_none() {
            banana_config.root_constraint = Some(messages::root_constraint());
        }
        let mut state = BrokerState::new(config.interfaces, config.unsafe_tracebacks);
        state.publish(ROOT_NAME.to_string(), root);
        Self {
            banana: Banana::new(banana_config, Arc::new(messages::registry()), state),
            purposes: HashMap::new(),
            held: Vec::new(),
            next_req_id: 1,
            connected: true,
        }
    }

    /// Make `object` callable by the peer under `name`.
    pub fn publish(&mut self, name: impl Into<String>, object: Arc<dyn Referenceable>) {
        self.banana.host_mut().publish(name.into(), object);
    }

    /// Proxy for the peer's root object.
    pub fn root(&self) -> RemoteReference {
        self.named_reference(ROOT_NAME, None)
    }

    /// Proxy for an object the peer published under `name`.
    ///
    /// `interface` names an entry in this broker's interface registry; when
    /// it resolves, calls through the proxy are validated locally.
    pub fn named_reference(&self, name: &str, interface: Option<&str>) -> RemoteReference {
        self.banana.host().named_reference(name, interface)
    }

    /// Call `method` on a peer object.
    ///
    /// # Errors
    ///
    /// Fails without touching the wire when the connection is gone, the
    /// proxy came from another broker, or the target's interface rejects
    /// the method or its arguments.
    pub fn call_remote(
        &mut self,
        target: &RemoteReference,
        method: &str,
        mut args: CallArgs,
    ) -> Result<RemoteCall, CallError> {
        if !self.connected {
            return Err(CallError::ConnectionLost);
        }
        if !self.banana.host().owns(target) {
            return Err(CallError::ForeignReference);
        }
        let result_override = args.take_result_constraint();
        let (bound, result) = match target.interface() {
            Some(interface) => {
                let schema = interface.require(method)?;
                let bound = schema.bind(args)?;
                (bound, result_override.or_else(|| schema.result().cloned()))
            },
            None => (args.bind_unchecked()?, result_override),
        };

        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let (tx, rx) = oneshot::channel();
        let active = Arc::new(AtomicBool::new(true));
        self.banana.host_mut().register_pending(
            req_id,
            PendingRequest {
                tx,
                active: Arc::clone(&active),
                constraint: result,
                method: method.to_string(),
            },
        );
        let message = Message::Call {
            req_id,
            target: target.ref_id().clone(),
            method: method.to_string(),
            args: bound,
        };
        let id = self.banana.send(message.into_value());
        self.purposes.insert(id, Purpose::Call(req_id));
        debug!(req_id, method, target = %target.ref_id(), "call queued");
        Ok(RemoteCall { req_id, rx, active, cancelled: false })
    }

    /// Queue the vocabulary table; later strings in the table are sent as
    /// VOCAB tokens.
    ///
    /// # Errors
    ///
    /// A connection sends at most one table.
    pub fn send_vocabulary(&mut self, words: impl IntoIterator<Item = Bytes>) -> Result<(), Violation> {
        self.banana.send_vocabulary(words).map(|_| ())
    }

    /// Feed bytes from the transport and run any calls they complete.
    pub fn data_received(&mut self, data: &[u8]) -> Vec<BrokerAction> {
        if !self.connected {
            return Vec::new();
        }
        match self.banana.data_received(data) {
            Ok(events) => {
                for event in events {
                    match event {
                        BananaEvent::Received(Value::None) => {},
                        BananaEvent::Received(other) => {
                            warn!(kind = other.kind(), "ignoring top-level value");
                        },
                        BananaEvent::Failure(failure) => {
                            warn!(violation = %failure.violation, "discarded top-level object");
                        },
                        BananaEvent::Sent(_) | BananaEvent::SendAborted { .. } => {},
                    }
                }
            },
            Err(err) => {
                let reason = err.to_string();
                self.connection_lost(&reason);
                return vec![BrokerAction::LoseConnection { reason }];
            },
        }
        self.dispatch_inbound();
        self.flush()
    }

    /// Serialize everything that is ready: queued calls, answers whose
    /// deferred results have settled, errors and decrefs for released
    /// proxies.
    pub fn flush(&mut self) -> Vec<BrokerAction> {
        if !self.connected {
            return Vec::new();
        }
        loop {
            self.settle_held();
            for message in self.banana.host_mut().take_outbox() {
                self.banana.send(message.into_value());
            }
            for (clid, count) in self.banana.host_mut().drain_releases() {
                debug!(clid, count, "proxy released");
                for _ in 0..count {
                    self.banana.send(Message::Decref { clid }.into_value());
                }
            }
            let events = self.banana.pump();
            self.handle_send_events(events);
            if self.banana.host().outbox_is_empty() {
                break;
            }
        }
        self.banana.take_outgoing().map(BrokerAction::Write).into_iter().collect()
    }

    /// The transport is gone: fail every pending call once and refuse new
    /// ones.
    pub fn connection_lost(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        info!(reason, pending = self.banana.host().pending_calls(), "connection lost");
        self.banana.host_mut().fail_all(&CallError::ConnectionLost);
        self.held.clear();
        self.purposes.clear();
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Outbound calls still awaiting an answer.
    pub fn pending_calls(&self) -> usize {
        self.banana.host().pending_calls()
    }

    /// Local objects the peer currently holds references to.
    pub fn exported_count(&self) -> usize {
        self.banana.host().exported_count()
    }

    /// Inbound calls whose answer is a deferred still waiting to settle.
    pub fn held_answers(&self) -> usize {
        self.held.len()
    }

    fn dispatch_inbound(&mut self) {
        for call in self.banana.host_mut().take_inbound() {
            debug!(req_id = call.req_id, method = %call.method, "dispatching call");
            match call.target.remote_call(&call.method, &call.args) {
                Ok(Value::Deferred(deferred)) => self.held.push(HeldAnswer {
                    req_id: call.req_id,
                    deferred,
                    result: call.result,
                }),
                Ok(value) => self.answer(call.req_id, value, call.result.as_ref()),
                Err(failure) => self.banana.host_mut().reject_inbound(call.req_id, failure),
            }
        }
    }

    fn settle_held(&mut self) {
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.held).into_iter().partition(|h| h.deferred.is_resolved());
        self.held = waiting;
        for held in ready {
            match held.deferred.peek() {
                Some(Ok(value)) => self.answer(held.req_id, value, held.result.as_ref()),
                Some(Err(violation)) => {
                    self.banana.host_mut().reject_inbound(held.req_id, Failure::from_violation(&violation));
                },
                None => self.held.push(held),
            }
        }
    }

    fn answer(&mut self, req_id: u64, value: Value, result: Option<&Constraint>) {
        if let Some(constraint) = result
            && let Err(violation) = constraint.check_value(&value)
        {
            let violation = violation.at("answer");
            self.banana.host_mut().reject_inbound(req_id, Failure::from_violation(&violation));
            return;
        }
        let id = self.banana.send(Message::Answer { req_id, value }.into_value());
        self.purposes.insert(id, Purpose::Answer(req_id));
    }

    fn handle_send_events(&mut self, events: Vec<BananaEvent>) {
        for event in events {
            match event {
                BananaEvent::Sent(id) => {
                    self.purposes.remove(&id);
                },
                BananaEvent::SendAborted { id, violation } => match self.purposes.remove(&id) {
                    Some(Purpose::Call(req_id)) => {
                        self.banana.host_mut().settle(req_id, Err(CallError::Violation(violation)));
                    },
                    Some(Purpose::Answer(req_id)) => {
                        self.banana.host_mut().reject_inbound(req_id, Failure::from_violation(&violation));
                    },
                    None => warn!(%violation, "send aborted"),
                },
                BananaEvent::Received(_) | BananaEvent::Failure(_) => {},
            }
        }
    }
}

/// The eventual outcome of [`Broker::call_remote`].
///
/// Resolves exactly once: with the answer, the peer's failure, a local
/// violation, connection loss, or cancellation.
#[derive(Debug)]
pub struct RemoteCall {
    req_id: u64,
    rx: oneshot::Receiver<Outcome>,
    active: Arc<AtomicBool>,
    cancelled: bool,
}

impl RemoteCall {
    /// Request id carried on the wire.
    pub fn req_id(&self) -> u64 {
        self.req_id
    }

    /// Stop waiting. A later answer is discarded; the call is not
    /// withdrawn from the peer.
    pub fn cancel(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.cancelled = true;
        }
    }

    /// The outcome, if it has arrived.
    pub fn try_result(&mut self) -> Option<Outcome> {
        if self.cancelled {
            return Some(Err(CallError::Cancelled));
        }
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CallError::ConnectionLost)),
        }
    }
}

impl Future for RemoteCall {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        let this = self.get_mut();
        if this.cancelled {
            return Poll::Ready(Err(CallError::Cancelled));
        }
        Pin::new(&mut this.rx).poll(cx).map(|received| received.unwrap_or(Err(CallError::ConnectionLost)))
    }
}

#[cfg(test)]
mod tests {
    use banana_core::Constraint;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        referenceable::MethodTable,
        schema::{InterfaceSchema, MethodSchema},
    };

    fn calculator() -> InterfaceSchema {
        InterfaceSchema::new("Calculator").method(
            MethodSchema::new("add")
                .arg("a", Constraint::int())
                .arg("b", Constraint::int())
                .returns(Constraint::int()),
        )
    }

    fn adder() -> Arc<dyn Referenceable> {
        MethodTable::new()
            .method("add", |args| Ok(Value::Int(args.int("a", 0)? + args.int("b", 1)?)))
            .build()
    }

    fn broker() -> Broker {
        let mut interfaces = InterfaceRegistry::new();
        interfaces.register(calculator());
        Broker::new(BrokerConfig { interfaces: Arc::new(interfaces), ..BrokerConfig::default() }, adder())
    }

    fn written(actions: &[BrokerAction]) -> Vec<u8> {
        let mut out = Vec::new();
        for action in actions {
            if let BrokerAction::Write(bytes) = action {
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    /// Shuttle bytes both ways until neither side has anything to say.
    fn exchange(a: &mut Broker, b: &mut Broker) {
        let mut to_b = written(&a.flush());
        let mut to_a = written(&b.flush());
        while !to_a.is_empty() || !to_b.is_empty() {
            let from_b = written(&b.data_received(&std::mem::take(&mut to_b)));
            let from_a = written(&a.data_received(&std::mem::take(&mut to_a)));
            to_a = from_b;
            to_b = from_a;
        }
    }

    #[test]
    fn call_wire_format() {
        let mut client = broker();
        let root = client.root();
        let call = client.call_remote(&root, "add", CallArgs::new().arg(2).arg(3)).unwrap();
        assert_eq!(call.req_id(), 1);
        assert_eq!(
            hex::encode(written(&client.flush())),
            concat!(
                "0088",
                "048263616c6c",
                "0181",
                "0482726f6f74",
                "0382616464",
                "018230",
                "0281",
                "018231",
                "0381",
                "0089",
            )
        );
    }

    #[test]
    fn add_round_trip() {
        let mut client = broker();
        let mut server = broker();
        let root = client.root();
        let mut call = client.call_remote(&root, "add", CallArgs::new().arg(2).arg(3)).unwrap();
        exchange(&mut client, &mut server);
        assert_eq!(call.try_result(), Some(Ok(Value::Int(5))));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn unknown_method_never_reaches_the_wire() {
        let mut client = broker();
        let root = client.named_reference(ROOT_NAME, Some("Calculator"));
        let err = client.call_remote(&root, "nonexistent", CallArgs::new()).unwrap_err();
        assert_eq!(
            err,
            CallError::UnknownMethod { interface: "Calculator".into(), method: "nonexistent".into() }
        );
        let err = client.call_remote(&root, "add", CallArgs::new().arg("two").arg(3)).unwrap_err();
        assert!(matches!(err, CallError::Violation(_)));
        assert!(client.flush().is_empty());
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn remote_failure_carries_type_and_message() {
        let mut client = broker();
        let mut server = broker();
        let root = client.root();
        let mut call = client.call_remote(&root, "sub", CallArgs::new()).unwrap();
        exchange(&mut client, &mut server);
        let Some(Err(CallError::Remote(failure))) = call.try_result() else {
            panic!("expected a remote failure");
        };
        assert_eq!(failure.type_name, "AttributeError");
        assert!(failure.message.contains("sub"));
        assert_eq!(failure.traceback, None);
    }

    #[test]
    fn connection_loss_fails_pending_calls_once() {
        let mut client = broker();
        let root = client.root();
        let mut call = client.call_remote(&root, "add", CallArgs::new().arg(1).arg(1)).unwrap();
        client.connection_lost("test");
        client.connection_lost("again");
        assert_eq!(call.try_result(), Some(Err(CallError::ConnectionLost)));
        assert_eq!(
            client.call_remote(&root, "add", CallArgs::new()).unwrap_err(),
            CallError::ConnectionLost
        );
        assert!(client.flush().is_empty());
    }

    #[test]
    fn fatal_bytes_drop_the_connection() {
        let mut client = broker();
        let root = client.root();
        let mut call = client.call_remote(&root, "add", CallArgs::new().arg(1).arg(1)).unwrap();
        let actions = client.data_received(&[0x80]);
        assert!(matches!(actions.as_slice(), [BrokerAction::LoseConnection { .. }]));
        assert!(!client.is_connected());
        assert_eq!(call.try_result(), Some(Err(CallError::ConnectionLost)));
    }

    #[test]
    fn proxies_do_not_cross_brokers() {
        let mut first = broker();
        let second = broker();
        let foreign = second.root();
        assert_eq!(
            first.call_remote(&foreign, "add", CallArgs::new()).unwrap_err(),
            CallError::ForeignReference
        );
    }

    #[test]
    fn cancelled_call_ignores_its_answer() {
        let mut client = broker();
        let mut server = broker();
        let root = client.root();
        let mut call = client.call_remote(&root, "add", CallArgs::new().arg(2).arg(2)).unwrap();
        call.cancel();
        assert_eq!(call.try_result(), Some(Err(CallError::Cancelled)));
        assert_eq!(client.pending_calls(), 1);
        exchange(&mut client, &mut server);
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(call.try_result(), Some(Err(CallError::Cancelled)));
    }

    #[tokio::test]
    async fn awaiting_does_not_block_other_calls() {
        let mut client = broker();
        let mut server = broker();
        let root = client.root();
        let first = client.call_remote(&root, "add", CallArgs::new().arg(1).arg(2)).unwrap();
        let second = client.call_remote(&root, "add", CallArgs::new().arg(3).arg(4)).unwrap();
        assert!(second.req_id() > first.req_id());
        exchange(&mut client, &mut server);
        assert_eq!(second.await, Ok(Value::Int(7)));
        assert_eq!(first.await, Ok(Value::Int(3)));
    }

    proptest! {
        #[test]
        fn req_ids_strictly_increase(n in 1usize..40) {
            let mut client = broker();
            let root = client.root();
            let ids: Vec<u64> = (0..n)
                .map(|_| client.call_remote(&root, "add", CallArgs::new()).unwrap().req_id())
                .collect();
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(client.pending_calls(), n);
        }
    }
}
