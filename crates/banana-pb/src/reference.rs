//! Remote object proxies.
//!
//! A [`RemoteReference`] names an object owned by the peer. Integer refIDs
//! (clids) are reference counted: the broker hands out one proxy per clid,
//! counts how many `my-reference` tokens it decoded for it, and when the
//! last clone of the proxy is dropped queues that many `decref`s for the
//! owner. String refIDs name published objects and are never counted.

use std::{
    any::Any,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use banana_core::{Object, ObjectRef, Value};

use crate::schema::InterfaceSchema;

/// How the peer names one of its objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefId {
    /// Reference-counted object id
    Clid(u64),
    /// Published name
    Name(String),
}

impl RefId {
    /// Wire form: INT for clids, STRING for names.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Clid(clid) => Value::from(*clid),
            Self::Name(name) => Value::bytes(name.clone().into_bytes()),
        }
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clid(clid) => write!(f, "clid {clid}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

/// Releases recorded by dropped proxies, drained by the owning broker.
#[derive(Debug, Default)]
pub(crate) struct ReleaseQueue(Mutex<Vec<(u64, u32)>>);

impl ReleaseQueue {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, u32)>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, clid: u64, count: u32) {
        self.lock().push((clid, count));
    }

    pub(crate) fn drain(&self) -> Vec<(u64, u32)> {
        std::mem::take(&mut *self.lock())
    }
}

/// Shared state behind every clone of one proxy.
pub struct RemoteObject {
    ref_id: RefId,
    interface: Option<Arc<InterfaceSchema>>,
    received: AtomicU32,
    release: Arc<ReleaseQueue>,
}

impl RemoteObject {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("ref_id", &self.ref_id)
            .field("interface", &self.interface.as_ref().map(|i| i.name()))
            .finish_non_exhaustive()
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        if let RefId::Clid(clid) = self.ref_id {
            self.release.push(clid, *self.received.get_mut());
        }
    }
}

impl Object for RemoteObject {
    fn type_name(&self) -> &'static str {
        "RemoteReference"
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Proxy for an object living on the peer.
#[derive(Clone, Debug)]
pub struct RemoteReference(Arc<RemoteObject>);

impl RemoteReference {
    pub(crate) fn new(
        ref_id: RefId,
        interface: Option<Arc<InterfaceSchema>>,
        release: Arc<ReleaseQueue>,
    ) -> Self {
        Self(Arc::new(RemoteObject { ref_id, interface, received: AtomicU32::new(0), release }))
    }

    pub(crate) fn from_shared(inner: Arc<RemoteObject>) -> Self {
        Self(inner)
    }

    pub(crate) fn shared(&self) -> &Arc<RemoteObject> {
        &self.0
    }

    /// The peer's name for the object.
    pub fn ref_id(&self) -> &RefId {
        &self.0.ref_id
    }

    /// Known interface, used for local validation.
    pub fn interface(&self) -> Option<&Arc<InterfaceSchema>> {
        self.0.interface.as_ref()
    }

    /// Whether this proxy was produced by the broker owning `release`.
    pub(crate) fn belongs_to(&self, release: &Arc<ReleaseQueue>) -> bool {
        Arc::ptr_eq(&self.0.release, release)
    }

    /// Whether both proxies are the same proxy.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Extract a proxy from a decoded value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(object) => object.downcast::<RemoteObject>().map(Self),
            _ => None,
        }
    }
}

impl From<RemoteReference> for Value {
    fn from(reference: RemoteReference) -> Self {
        Value::Object(ObjectRef::new(reference.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_drop_releases_received_count() {
        let queue = Arc::new(ReleaseQueue::default());
        let reference = RemoteReference::new(RefId::Clid(7), None, Arc::clone(&queue));
        reference.shared().record_received();
        reference.shared().record_received();
        let clone = reference.clone();
        drop(reference);
        assert!(queue.drain().is_empty());
        drop(clone);
        assert_eq!(queue.drain(), vec![(7, 2)]);
    }

    #[test]
    fn named_references_are_not_counted() {
        let queue = Arc::new(ReleaseQueue::default());
        drop(RemoteReference::new(RefId::Name("root".into()), None, Arc::clone(&queue)));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn value_roundtrip_keeps_identity() {
        let queue = Arc::new(ReleaseQueue::default());
        let reference = RemoteReference::new(RefId::Clid(1), None, queue);
        let value = Value::from(reference.clone());
        let back = RemoteReference::from_value(&value).unwrap();
        assert!(back.ptr_eq(&reference));
    }
}
