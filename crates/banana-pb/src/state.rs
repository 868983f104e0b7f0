//! Per-connection broker tables.
//!
//! [`BrokerState`] is the codec [`Host`] for a broker connection. Inbound
//! unslicers reach it through their context to resolve targets, settle
//! pending requests and adjust reference counts; the send pump asks it to
//! slice local objects, proxies and messages.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use banana_core::{Constraint, FixedSlicer, Host, ObjectRef, Slicer, Value, Violation};
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{
    error::CallError,
    failure::Failure,
    messages::{MY_REFERENCE, Message},
    reference::{RefId, ReleaseQueue, RemoteObject, RemoteReference},
    referenceable::{LocalObject, Referenceable, identity},
    schema::{Arguments, InterfaceRegistry},
};

pub(crate) type Outcome = Result<Value, CallError>;

/// A call decoded from the peer, ready to run.
pub(crate) struct InboundCall {
    pub(crate) req_id: u64,
    pub(crate) target: Arc<dyn Referenceable>,
    pub(crate) method: String,
    pub(crate) args: Arguments,
    pub(crate) result: Option<Constraint>,
}

/// An outbound call awaiting its answer.
pub(crate) struct PendingRequest {
    pub(crate) tx: oneshot::Sender<Outcome>,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) constraint: Option<Constraint>,
    pub(crate) method: String,
}

impl PendingRequest {
    /// Resolve or reject the caller's future, at most once.
    pub(crate) fn settle(self, req_id: u64, outcome: Outcome) {
        if !self.active.swap(false, Ordering::AcqRel) {
            debug!(req_id, method = %self.method, "discarding outcome of cancelled call");
            return;
        }
        if self.tx.send(outcome).is_err() {
            debug!(req_id, method = %self.method, "caller dropped its future");
        }
    }
}

struct Exported {
    object: Arc<dyn Referenceable>,
    refcount: u64,
}

/// Object tables for one connection.
pub(crate) struct BrokerState {
    interfaces: Arc<InterfaceRegistry>,
    unsafe_tracebacks: bool,
    next_clid: u64,
    exported: HashMap<u64, Exported>,
    clid_by_identity: HashMap<usize, u64>,
    published: HashMap<String, Arc<dyn Referenceable>>,
    remote_refs: HashMap<u64, Weak<RemoteObject>>,
    release: Arc<ReleaseQueue>,
    waiting: HashMap<u64, PendingRequest>,
    inbound: Vec<InboundCall>,
    outbox: Vec<Message>,
}

impl BrokerState {
    pub(crate) fn new(interfaces: Arc<InterfaceRegistry>, unsafe_tracebacks: bool) -> Self {
        Self {
            interfaces,
            unsafe_tracebacks,
            next_clid: 1,
            exported: HashMap::new(),
            clid_by_identity: HashMap::new(),
            published: HashMap::new(),
            remote_refs: HashMap::new(),
            release: Arc::new(ReleaseQueue::default()),
            waiting: HashMap::new(),
            inbound: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub(crate) fn publish(&mut self, name: String, object: Arc<dyn Referenceable>) {
        self.published.insert(name, object);
    }

    /// Local object named by a refID, if it is still live.
    pub(crate) fn target(&self, ref_id: &RefId) -> Option<Arc<dyn Referenceable>> {
        match ref_id {
            RefId::Clid(clid) => self.exported.get(clid).map(|e| Arc::clone(&e.object)),
            RefId::Name(name) => self.published.get(name).cloned(),
        }
    }

    pub(crate) fn exported_count(&self) -> usize {
        self.exported.len()
    }

    /// Clid for `object`, counting one more reference held by the peer.
    fn export(&mut self, object: &Arc<dyn Referenceable>) -> u64 {
        let key = identity(object);
        let clid = match self.clid_by_identity.get(&key) {
            Some(clid) => *clid,
            None => {
                let clid = self.next_clid;
                self.next_clid += 1;
                self.clid_by_identity.insert(key, clid);
                self.exported.insert(clid, Exported { object: Arc::clone(object), refcount: 0 });
                clid
            },
        };
        if let Some(entry) = self.exported.get_mut(&clid) {
            entry.refcount += 1;
        }
        clid
    }

    pub(crate) fn decref(&mut self, clid: u64) {
        let Some(entry) = self.exported.get_mut(&clid) else {
            warn!(clid, "decref for unknown clid");
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0
            && let Some(entry) = self.exported.remove(&clid)
        {
            self.clid_by_identity.remove(&identity(&entry.object));
            debug!(clid, "released exported object");
        }
    }

    /// Proxy for a peer clid, shared with any proxy still alive for it.
    pub(crate) fn remote_reference(&mut self, clid: u64, interface: Option<&str>) -> RemoteReference {
        let reference = match self.remote_refs.get(&clid).and_then(Weak::upgrade) {
            Some(shared) => RemoteReference::from_shared(shared),
            None => {
                let interface = interface.and_then(|name| self.interfaces.get(name));
                let reference =
                    RemoteReference::new(RefId::Clid(clid), interface, Arc::clone(&self.release));
                self.remote_refs.insert(clid, Arc::downgrade(reference.shared()));
                reference
            },
        };
        reference.shared().record_received();
        reference
    }

    /// Proxy for an object the peer published under `name`.
    pub(crate) fn named_reference(&self, name: &str, interface: Option<&str>) -> RemoteReference {
        let interface = interface.and_then(|n| self.interfaces.get(n));
        RemoteReference::new(RefId::Name(name.to_string()), interface, Arc::clone(&self.release))
    }

    pub(crate) fn owns(&self, reference: &RemoteReference) -> bool {
        reference.belongs_to(&self.release)
    }

    /// Released proxies, forgetting cache entries with no live proxy left.
    pub(crate) fn drain_releases(&mut self) -> Vec<(u64, u32)> {
        let released = self.release.drain();
        for (clid, _) in &released {
            if self.remote_refs.get(clid).is_some_and(|w| w.strong_count() == 0) {
                self.remote_refs.remove(clid);
            }
        }
        released
    }

    /// Owe the peer one decref for a `my-reference` that never became a
    /// proxy.
    pub(crate) fn release_unread(&self, clid: u64) {
        debug!(clid, "releasing reference dropped before decoding");
        self.release.push(clid, 1);
    }

    pub(crate) fn register_pending(&mut self, req_id: u64, pending: PendingRequest) {
        self.waiting.insert(req_id, pending);
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.waiting.len()
    }

    /// Result constraint of a pending request; unknown ids are a violation.
    pub(crate) fn answer_constraint(&self, req_id: u64) -> Result<Option<Constraint>, Violation> {
        match self.waiting.get(&req_id) {
            Some(pending) => Ok(pending.constraint.clone()),
            None => {
                error!(req_id, "response for unknown request");
                Err(Violation::new(format!("unknown request id {req_id}")))
            },
        }
    }

    pub(crate) fn settle(&mut self, req_id: u64, outcome: Outcome) {
        match self.waiting.remove(&req_id) {
            Some(pending) => pending.settle(req_id, outcome),
            None => error!(req_id, "request settled twice"),
        }
    }

    /// Fail every pending request with `err`.
    pub(crate) fn fail_all(&mut self, err: &CallError) {
        for (req_id, pending) in self.waiting.drain() {
            pending.settle(req_id, Err(err.clone()));
        }
    }

    pub(crate) fn push_inbound(&mut self, call: InboundCall) {
        self.inbound.push(call);
    }

    pub(crate) fn take_inbound(&mut self) -> Vec<InboundCall> {
        std::mem::take(&mut self.inbound)
    }

    /// Answer an inbound call with an `error`.
    pub(crate) fn reject_inbound(&mut self, req_id: u64, failure: Failure) {
        debug!(req_id, %failure, "rejecting inbound call");
        self.outbox.push(Message::Error { req_id, description: failure.to_wire(self.unsafe_tracebacks) });
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn outbox_is_empty(&self) -> bool {
        self.outbox.is_empty()
    }
}

impl Host for BrokerState {
    fn slice_object(&mut self, object: &ObjectRef) -> Result<Box<dyn Slicer<Self>>, Violation> {
        if let Some(message) = object.downcast::<Message>() {
            return Ok(Box::new(message.slicer()));
        }
        if let Some(local) = object.downcast::<LocalObject>() {
            let clid = self.export(local.object());
            let mut children = vec![Value::from(clid)];
            if let Some(interface) = local.object().interface() {
                children.push(Value::Bytes(Bytes::copy_from_slice(interface.name().as_bytes())));
            }
            return Ok(Box::new(FixedSlicer::new(MY_REFERENCE, children)));
        }
        if let Some(remote) = object.downcast::<RemoteObject>() {
            let reference = RemoteReference::from_shared(remote);
            if !self.owns(&reference) {
                return Err(Violation::new("reference belongs to another connection"));
            }
            return Ok(Box::new(FixedSlicer::new("your-reference", vec![reference.ref_id().to_value()])));
        }
        Err(Violation::new(format!("cannot serialize {}", object.type_name())))
    }

    fn skipped(&mut self, opentype: &[u8], first: u64) {
        if opentype == MY_REFERENCE.as_bytes() {
            self.release_unread(first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::referenceable::{MethodTable, export};

    fn state() -> BrokerState {
        BrokerState::new(Arc::new(InterfaceRegistry::new()), false)
    }

    fn slice(state: &mut BrokerState, value: &Value) -> Vec<Value> {
        let Value::Object(object) = value else { panic!("not an object") };
        let mut slicer = state.slice_object(object).unwrap();
        let mut children = Vec::new();
        while let Some(child) = slicer.next_child(state).unwrap() {
            children.push(child);
        }
        children
    }

    #[test]
    fn exported_object_keeps_its_clid_until_released() {
        let mut state = state();
        let object = MethodTable::new().build();
        let value = export(Arc::clone(&object));

        assert_eq!(slice(&mut state, &value), vec![Value::Int(1)]);
        assert_eq!(slice(&mut state, &value), vec![Value::Int(1)]);
        assert!(state.target(&RefId::Clid(1)).is_some());

        state.decref(1);
        assert!(state.target(&RefId::Clid(1)).is_some());
        state.decref(1);
        assert!(state.target(&RefId::Clid(1)).is_none());

        // a fresh export after release gets a fresh clid
        assert_eq!(slice(&mut state, &value), vec![Value::Int(2)]);
    }

    #[test]
    fn remote_references_are_deduplicated() {
        let mut state = state();
        let first = state.remote_reference(4, None);
        let second = state.remote_reference(4, None);
        assert!(first.ptr_eq(&second));
        drop(first);
        drop(second);
        assert_eq!(state.drain_releases(), vec![(4, 2)]);
        assert!(state.remote_refs.is_empty());
    }

    #[test]
    fn foreign_proxy_is_not_sliced() {
        let mut ours = state();
        let mut theirs = state();
        let reference = theirs.remote_reference(1, None);
        let value = Value::from(reference);
        let Value::Object(object) = &value else { panic!("not an object") };
        assert!(ours.slice_object(object).is_err());
        assert_eq!(slice(&mut theirs, &value), vec![Value::Int(1)]);
    }

    #[test]
    fn cancelled_request_is_not_settled() {
        let mut state = state();
        let (tx, mut rx) = oneshot::channel();
        let active = Arc::new(AtomicBool::new(true));
        state.register_pending(
            9,
            PendingRequest { tx, active: Arc::clone(&active), constraint: None, method: "m".into() },
        );
        active.store(false, Ordering::Release);
        state.settle(9, Ok(Value::Int(1)));
        assert!(rx.try_recv().is_err());
        assert_eq!(state.pending_calls(), 0);
    }
}
