//! Values carried by the codec.
//!
//! Primitives are plain data. Lists and dicts are shared, mutable handles so
//! that an object sent twice decodes to one object with two names, and so a
//! reference can point at a list that is still being filled. Tuples are
//! immutable and only become referenceable once complete.
//!
//! Shared handles are `Arc<Mutex<_>>`: values cross threads with the futures
//! that carry call results.
//!
//! Lists and dicts may contain themselves. Equality and `Debug` track the
//! handles they are inside of on the current thread, so a cycle compares
//! equal on revisit and prints as `[...]` or `{...}`.

use std::{
    any::Any,
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use banana_proto::Violation;
use bytes::Bytes;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    static VISITING: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

/// Marks a pair of handles as being walked until dropped.
struct Visit((usize, usize));

impl Visit {
    /// `None` if the pair is already being walked further up this thread.
    fn enter(key: (usize, usize)) -> Option<Self> {
        VISITING.with_borrow_mut(|visiting| {
            if visiting.contains(&key) {
                None
            } else {
                visiting.push(key);
                Some(Self(key))
            }
        })
    }
}

impl Drop for Visit {
    fn drop(&mut self) {
        VISITING.with_borrow_mut(|visiting| {
            if let Some(position) = visiting.iter().rposition(|key| *key == self.0) {
                visiting.remove(position);
            }
        });
    }
}

fn address<T>(shared: &Arc<T>) -> usize {
    Arc::as_ptr(shared) as *const () as usize
}

/// A decoded or to-be-encoded value.
#[derive(Clone)]
pub enum Value {
    /// `none` opentype
    None,
    /// `boolean` opentype
    Bool(bool),
    /// INT, NEG, LONGINT, LONGNEG
    Int(i128),
    /// FLOAT
    Float(f64),
    /// STRING (or VOCAB)
    Bytes(Bytes),
    /// `unicode` opentype
    Text(String),
    /// `list` opentype
    List(List),
    /// `tuple` opentype
    Tuple(Tuple),
    /// `dict` opentype
    Dict(Dict),
    /// Host-specific object, sliced by the connection's host
    Object(ObjectRef),
    /// Result that may not exist yet. Only meaningful when sending.
    Deferred(Deferred),
}

impl Value {
    /// Build a list value.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(List::new(items.into_iter().collect()))
    }

    /// Build a tuple value.
    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Self::Tuple(Tuple::new(items.into_iter().collect()))
    }

    /// Build a dict value.
    pub fn dict(entries: impl IntoIterator<Item = (Key, Value)>) -> Self {
        Self::Dict(Dict::new(entries.into_iter().collect()))
    }

    /// Build a byte string value.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes(data.into())
    }

    /// Short type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bytes(_) => "string",
            Self::Text(_) => "unicode",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Object(_) => "object",
            Self::Deferred(_) => "deferred",
        }
    }

    /// Integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte string payload, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text payload, accepting either a unicode value or UTF-8 bytes.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Identity of a shared composite, used for reference tracking.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Self::List(l) => Some(address(&l.0)),
            Self::Dict(d) => Some(address(&d.0)),
            Self::Tuple(t) => Some(address(&t.0)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Deferred(a), Self::Deferred(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "{v:?}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::List(v) => v.fmt(f),
            Self::Tuple(v) => v.fmt(f),
            Self::Dict(v) => v.fmt(f),
            Self::Object(v) => v.fmt(f),
            Self::Deferred(v) => v.fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Int(v.into())
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(List::new(v))
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::None => Self::None,
            Key::Bool(v) => Self::Bool(v),
            Key::Int(v) => Self::Int(v),
            Key::Bytes(v) => Self::Bytes(v),
            Key::Text(v) => Self::Text(v),
        }
    }
}

/// Shared, growable sequence.
#[derive(Clone)]
pub struct List(Arc<Mutex<Vec<Value>>>);

impl List {
    /// Wrap items in a new shared list.
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(Mutex::new(items)))
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }

    /// Clone of the item at `index`.
    pub fn get(&self, index: usize) -> Option<Value> {
        lock(&self.0).get(index).cloned()
    }

    /// Append an item.
    pub fn push(&self, value: Value) {
        lock(&self.0).push(value);
    }

    /// Clone of all items.
    pub fn snapshot(&self) -> Vec<Value> {
        lock(&self.0).clone()
    }

    /// Whether both handles name the same list.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match Visit::enter((address(&self.0), address(&other.0))) {
            Some(_visit) => self.snapshot() == other.snapshot(),
            None => true,
        }
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Visit::enter((address(&self.0), 0)) {
            Some(_visit) => f.debug_list().entries(self.snapshot()).finish(),
            None => f.write_str("[...]"),
        }
    }
}

/// Immutable, fixed-arity sequence.
#[derive(Clone)]
pub struct Tuple(Arc<Vec<Value>>);

impl Tuple {
    /// Wrap items in a new tuple.
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(items))
    }

    /// Items of the tuple.
    pub fn items(&self) -> &[Value] {
        &self.0
    }

    /// Whether both handles name the same tuple.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut t = f.debug_tuple("");
        for item in self.0.iter() {
            t.field(item);
        }
        t.finish()
    }
}

/// Hashable primitive usable as a dict key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// none
    None,
    /// boolean
    Bool(bool),
    /// integer
    Int(i128),
    /// byte string
    Bytes(Bytes),
    /// text
    Text(String),
}

impl TryFrom<Value> for Key {
    type Error = Violation;

    fn try_from(value: Value) -> Result<Self, Violation> {
        match value {
            Value::None => Ok(Self::None),
            Value::Bool(v) => Ok(Self::Bool(v)),
            Value::Int(v) => Ok(Self::Int(v)),
            Value::Bytes(v) => Ok(Self::Bytes(v)),
            Value::Text(v) => Ok(Self::Text(v)),
            Value::Deferred(_) => Err(Violation::new("unresolved value used as dict key")),
            other => Err(Violation::new(format!("{} is not usable as a dict key", other.kind()))),
        }
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Self::Int(v.into())
    }
}

/// Shared key→value mapping with deterministic (sorted) iteration.
#[derive(Clone)]
pub struct Dict(Arc<Mutex<BTreeMap<Key, Value>>>);

impl Dict {
    /// Wrap entries in a new shared dict.
    pub fn new(entries: BTreeMap<Key, Value>) -> Self {
        Self(Arc::new(Mutex::new(entries)))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    /// Whether the dict is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }

    /// Clone of the value stored under `key`.
    pub fn get(&self, key: &Key) -> Option<Value> {
        lock(&self.0).get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &Key) -> bool {
        lock(&self.0).contains_key(key)
    }

    /// Insert an entry, returning the previous value.
    pub fn insert(&self, key: Key, value: Value) -> Option<Value> {
        lock(&self.0).insert(key, value)
    }

    /// Clone of all entries in key order.
    pub fn snapshot(&self) -> Vec<(Key, Value)> {
        lock(&self.0).iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Whether both handles name the same dict.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Dict {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match Visit::enter((address(&self.0), address(&other.0))) {
            Some(_visit) => self.snapshot() == other.snapshot(),
            None => true,
        }
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Visit::enter((address(&self.0), 0)) {
            Some(_visit) => f.debug_map().entries(self.snapshot()).finish(),
            None => f.write_str("{...}"),
        }
    }
}

/// A host-specific value the codec cannot slice on its own.
///
/// The connection's [`crate::Host`] decides how (or whether) such objects are
/// sent; receiving hosts produce them from their own opentypes.
pub trait Object: Any + Send + Sync + fmt::Debug {
    /// Name used in "cannot serialize" violations.
    fn type_name(&self) -> &'static str;

    /// Upcast for downcasting to the concrete type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared handle to a host object.
#[derive(Clone, Debug)]
pub struct ObjectRef(Arc<dyn Object>);

impl ObjectRef {
    /// Wrap a host object.
    pub fn new<T: Object>(object: Arc<T>) -> Self {
        Self(object)
    }

    /// Name of the concrete type.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    /// Borrow the concrete object if it is a `T`.
    pub fn downcast<T: Object>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).into_any().downcast::<T>().ok()
    }

    /// Whether both handles name the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Self::Object(object)
    }
}

#[derive(Debug)]
enum DeferredState {
    Pending,
    Ready(Result<Value, Violation>),
}

/// A value that will be supplied later.
///
/// Sending a deferred suspends the outbound pump at that position until
/// [`Deferred::resolve`] or [`Deferred::fail`] is called and the codec is
/// pumped again. Clones share the same slot.
#[derive(Clone)]
pub struct Deferred(Arc<Mutex<DeferredState>>);

impl Deferred {
    /// Create an unresolved deferred.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(DeferredState::Pending)))
    }

    /// Supply the value. Later calls are ignored.
    pub fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    /// Supply a failure. The sender aborts the enclosing object.
    pub fn fail(&self, violation: Violation) {
        self.settle(Err(violation));
    }

    fn settle(&self, result: Result<Value, Violation>) {
        let mut state = lock(&self.0);
        if matches!(*state, DeferredState::Pending) {
            *state = DeferredState::Ready(result);
        }
    }

    /// Whether a value or failure has been supplied.
    pub fn is_resolved(&self) -> bool {
        matches!(*lock(&self.0), DeferredState::Ready(_))
    }

    /// The outcome, if supplied.
    pub fn peek(&self) -> Option<Result<Value, Violation>> {
        match &*lock(&self.0) {
            DeferredState::Pending => None,
            DeferredState::Ready(result) => Some(result.clone()),
        }
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_resolved() { f.write_str("Deferred(resolved)") } else { f.write_str("Deferred(pending)") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_identity_and_equality() {
        let a = List::new(vec![Value::Int(1)]);
        let b = a.clone();
        let c = List::new(vec![Value::Int(1)]);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a, c);
        b.push(Value::Int(2));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn self_containing_list_compares_to_itself() {
        let list = List::new(Vec::new());
        list.push(Value::List(list.clone()));
        assert_eq!(Value::List(list.clone()), Value::List(list));
    }

    #[test]
    fn distinct_cycles_compare_and_print() {
        let cycle = |head: i128| {
            let list = List::new(vec![Value::Int(head)]);
            list.push(Value::List(list.clone()));
            list
        };
        let (a, b, c) = (cycle(1), cycle(1), cycle(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{a:?}"), "[1, [...]]");

        let dict = Dict::default();
        dict.insert(Key::from("self"), Value::Dict(dict.clone()));
        assert_eq!(format!("{dict:?}"), r#"{Text("self"): {...}}"#);
    }

    #[test]
    fn deferred_settles_once() {
        let d = Deferred::new();
        assert!(!d.is_resolved());
        d.resolve(Value::Int(1));
        d.resolve(Value::Int(2));
        d.fail(Violation::new("late"));
        assert_eq!(d.peek(), Some(Ok(Value::Int(1))));
    }

    #[test]
    fn keys_reject_composites_and_deferreds() {
        assert!(Key::try_from(Value::list([])).is_err());
        assert!(Key::try_from(Value::Float(1.0)).is_err());
        assert!(Key::try_from(Value::Deferred(Deferred::new())).is_err());
        assert_eq!(Key::try_from(Value::Int(3)), Ok(Key::Int(3)));
    }

    #[test]
    fn text_accessor_accepts_utf8_bytes() {
        assert_eq!(Value::bytes("add").as_text(), Some("add"));
        assert_eq!(Value::from("add").as_text(), Some("add"));
        assert_eq!(Value::Int(1).as_text(), None);
    }
}
