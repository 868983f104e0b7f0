//! Inbound reconstruction state machines.
//!
//! An unslicer is pushed when an OPEN for its opentype arrives and popped on
//! the matching CLOSE. Between the two it is offered every token header
//! ([`Unslicer::check_token`]) before the token is consumed, receives every
//! finished child ([`Unslicer::receive_child`]), and finally yields its value
//! ([`Unslicer::receive_close`]).
//!
//! Every method returns `Result<_, Violation>`. An `Err` abandons the frame:
//! the codec pops it, discards the rest of its tokens, and hands the failure
//! to the parent in place of a value.

use std::collections::HashMap;

use banana_proto::{TokenType, UnbananaFailure, Violation};
use bytes::Bytes;

use crate::{
    constraint::Constraint,
    registry::Registry,
    value::{Dict, Key, List, Tuple, Value},
};

/// Decoder state for one composite value.
pub trait Unslicer<H>: Send {
    /// Called once after the unslicer is created, with its OPEN index.
    fn start(&mut self, _count: u64, _cx: &mut Context<'_, H>) -> Result<(), Violation> {
        Ok(())
    }

    /// Accept or refuse the next token before it is consumed.
    fn check_token(&self, _token: TokenType, _size: u64) -> Result<(), Violation> {
        Ok(())
    }

    /// Resolve a child OPEN from its index tokens.
    ///
    /// `Ok(None)` asks for another index token.
    fn do_open(
        &mut self,
        index: &[Bytes],
        cx: &mut Context<'_, H>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        cx.open(index, None)
    }

    /// A child value finished, or failed.
    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        cx: &mut Context<'_, H>,
    ) -> Result<(), Violation>;

    /// The matching CLOSE arrived; produce the finished value.
    fn receive_close(&mut self, cx: &mut Context<'_, H>) -> Result<Value, Violation>;

    /// The frame is being abandoned because of `violation`.
    fn abandoned(&mut self, _violation: &Violation, _cx: &mut Context<'_, H>) {}

    /// Cleanup after close or abandonment.
    fn finish(&mut self, _cx: &mut Context<'_, H>) {}
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Ready(Value),
}

/// Objects introduced by OPENs in the current reference scope.
#[derive(Debug, Default)]
pub struct References {
    slots: HashMap<u64, Slot>,
}

impl References {
    /// Forget every object.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no object is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// What an unslicer can reach while it runs.
pub struct Context<'a, H> {
    /// Connection-specific state
    pub host: &'a mut H,
    pub(crate) references: &'a mut References,
    pub(crate) registry: &'a Registry<H>,
}

impl<H> Context<'_, H> {
    /// Look up a nested opentype in the registry.
    pub fn open(
        &mut self,
        index: &[Bytes],
        constraint: Option<&Constraint>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        self.registry.open_nested(index, constraint)
    }

    /// Register the object introduced by OPEN `count`.
    pub fn set_object(&mut self, count: u64, value: Value) {
        self.references.slots.insert(count, Slot::Ready(value));
    }

    /// Mark OPEN `count` as an object that cannot be referenced yet.
    pub fn reserve_object(&mut self, count: u64) {
        self.references.slots.insert(count, Slot::Pending);
    }

    /// Resolve a `reference` index.
    pub fn object(&self, index: u64) -> Result<Value, Violation> {
        match self.references.slots.get(&index) {
            Some(Slot::Ready(value)) => Ok(value.clone()),
            Some(Slot::Pending) => {
                Err(Violation::new(format!("reference {index} names a tuple still being built")))
            },
            None => Err(Violation::new(format!("reference {index} names no earlier object"))),
        }
    }
}

/// Find the alternative of `constraint` that governs `opentype`.
///
/// `Any` (and no constraint) narrows to `None`, meaning unconstrained.
pub fn narrow<'c>(constraint: Option<&'c Constraint>, opentype: &str) -> Option<&'c Constraint> {
    match constraint? {
        Constraint::Any => None,
        Constraint::Optional(inner) => narrow(Some(inner), opentype),
        Constraint::Choice(options) => {
            let chosen = options.iter().find(|c| c.check_opentype(opentype).is_ok())?;
            narrow(Some(chosen), opentype)
        },
        other => Some(other),
    }
}

fn check_child(constraint: Option<&Constraint>, token: TokenType, size: u64) -> Result<(), Violation> {
    constraint.map_or(Ok(()), |c| c.check_token(token, size))
}

/// `list`
pub struct ListUnslicer {
    list: List,
    item: Option<Constraint>,
    max_length: Option<usize>,
}

impl ListUnslicer {
    /// Create from the parent's constraint for this position.
    pub fn new(constraint: Option<&Constraint>) -> Self {
        let (item, max_length) = match constraint {
            Some(Constraint::List { item, max_length }) => {
                (Some(item.as_ref().clone()), Some(*max_length))
            },
            _ => (None, None),
        };
        Self { list: List::new(Vec::new()), item, max_length }
    }
}

impl<H> Unslicer<H> for ListUnslicer {
    fn start(&mut self, count: u64, cx: &mut Context<'_, H>) -> Result<(), Violation> {
        cx.set_object(count, Value::List(self.list.clone()));
        Ok(())
    }

    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        if let Some(max) = self.max_length
            && self.list.len() >= max
        {
            return Err(Violation::new(format!("list exceeds maximum length {max}")));
        }
        check_child(self.item.as_ref(), token, size)
    }

    fn do_open(
        &mut self,
        index: &[Bytes],
        cx: &mut Context<'_, H>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        cx.open(index, self.item.as_ref())
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        self.list.push(child.map_err(|f| f.violation)?);
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        Ok(Value::List(self.list.clone()))
    }
}

/// `tuple`
pub struct TupleUnslicer {
    items: Vec<Value>,
    slots: Option<Vec<Constraint>>,
    count: u64,
}

impl TupleUnslicer {
    /// Create from the parent's constraint for this position.
    pub fn new(constraint: Option<&Constraint>) -> Self {
        let slots = match constraint {
            Some(Constraint::Tuple(slots)) => Some(slots.clone()),
            _ => None,
        };
        Self { items: Vec::new(), slots, count: 0 }
    }

    fn slot(&self) -> Option<&Constraint> {
        self.slots.as_ref().and_then(|s| s.get(self.items.len()))
    }
}

impl<H> Unslicer<H> for TupleUnslicer {
    fn start(&mut self, count: u64, cx: &mut Context<'_, H>) -> Result<(), Violation> {
        self.count = count;
        cx.reserve_object(count);
        Ok(())
    }

    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        if let Some(slots) = &self.slots
            && self.items.len() >= slots.len()
        {
            return Err(Violation::new(format!("tuple has more than {} items", slots.len())));
        }
        check_child(self.slot(), token, size)
    }

    fn do_open(
        &mut self,
        index: &[Bytes],
        cx: &mut Context<'_, H>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        let slot = self.slot().cloned();
        cx.open(index, slot.as_ref())
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        self.items.push(child.map_err(|f| f.violation)?);
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        if let Some(slots) = &self.slots
            && slots.len() != self.items.len()
        {
            return Err(Violation::new(format!(
                "tuple needs {} items, got {}",
                slots.len(),
                self.items.len()
            )));
        }
        let value = Value::Tuple(Tuple::new(std::mem::take(&mut self.items)));
        cx.set_object(self.count, value.clone());
        Ok(value)
    }
}

/// `dict`: keys and values alternate, key first.
pub struct DictUnslicer {
    dict: Dict,
    key: Option<Constraint>,
    value: Option<Constraint>,
    max_keys: Option<usize>,
    pending_key: Option<Key>,
}

impl DictUnslicer {
    /// Create from the parent's constraint for this position.
    pub fn new(constraint: Option<&Constraint>) -> Self {
        let (key, value, max_keys) = match constraint {
            Some(Constraint::Dict { key, value, max_keys }) => (
                Some(key.as_ref().clone()),
                Some(value.as_ref().clone()),
                Some(*max_keys),
            ),
            _ => (None, None, None),
        };
        Self { dict: Dict::default(), key, value, max_keys, pending_key: None }
    }

    fn current(&self) -> Option<&Constraint> {
        if self.pending_key.is_some() { self.value.as_ref() } else { self.key.as_ref() }
    }
}

impl<H> Unslicer<H> for DictUnslicer {
    fn start(&mut self, count: u64, cx: &mut Context<'_, H>) -> Result<(), Violation> {
        cx.set_object(count, Value::Dict(self.dict.clone()));
        Ok(())
    }

    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        if self.pending_key.is_none() {
            if let Some(max) = self.max_keys
                && self.dict.len() >= max
            {
                return Err(Violation::new(format!("dict exceeds maximum of {max} keys")));
            }
            if token == TokenType::Float {
                return Err(Violation::new("float is not usable as a dict key"));
            }
        }
        check_child(self.current(), token, size)
    }

    fn do_open(
        &mut self,
        index: &[Bytes],
        cx: &mut Context<'_, H>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        let constraint = self.current().cloned();
        cx.open(index, constraint.as_ref())
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        let child = child.map_err(|f| f.violation)?;
        match self.pending_key.take() {
            None => {
                let key = Key::try_from(child)?;
                if self.dict.contains_key(&key) {
                    return Err(Violation::new(format!("duplicate dict key {key:?}")));
                }
                self.pending_key = Some(key);
            },
            Some(key) => {
                self.dict.insert(key, child);
            },
        }
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        if self.pending_key.is_some() {
            return Err(Violation::new("dict closed between key and value"));
        }
        Ok(Value::Dict(self.dict.clone()))
    }
}

/// `reference`: one INT naming an earlier OPEN in the same scope.
pub struct ReferenceUnslicer {
    target: Option<Value>,
    constraint: Option<Constraint>,
}

impl ReferenceUnslicer {
    /// Create; the resolved object is checked against `constraint`.
    pub fn new(constraint: Option<&Constraint>) -> Self {
        Self { target: None, constraint: constraint.cloned() }
    }
}

impl<H> Unslicer<H> for ReferenceUnslicer {
    fn check_token(&self, token: TokenType, _size: u64) -> Result<(), Violation> {
        if self.target.is_some() {
            return Err(Violation::new("reference takes a single index"));
        }
        if token != TokenType::Int {
            return Err(Violation::new(format!("reference index must be INT, got {}", token.name())));
        }
        Ok(())
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        let index = child
            .map_err(|f| f.violation)?
            .as_int()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| Violation::new("reference index must be a non-negative INT"))?;
        let target = cx.object(index)?;
        if let Some(constraint) = &self.constraint {
            constraint.check_value(&target)?;
        }
        self.target = Some(target);
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        self.target.take().ok_or_else(|| Violation::new("reference without an index"))
    }
}

/// `none`: no body.
pub struct NoneUnslicer;

impl<H> Unslicer<H> for NoneUnslicer {
    fn check_token(&self, token: TokenType, _size: u64) -> Result<(), Violation> {
        Err(Violation::new(format!("none takes no body, got {}", token.name())))
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        child.map_err(|f| f.violation)?;
        Err(Violation::new("none takes no body"))
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        Ok(Value::None)
    }
}

/// `boolean`: one INT, 0 or 1.
#[derive(Default)]
pub struct BooleanUnslicer {
    value: Option<bool>,
}

impl<H> Unslicer<H> for BooleanUnslicer {
    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        if self.value.is_some() || token != TokenType::Int || size > 1 {
            return Err(Violation::new("boolean takes a single INT of 0 or 1"));
        }
        Ok(())
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        match child.map_err(|f| f.violation)? {
            Value::Int(0) => self.value = Some(false),
            Value::Int(1) => self.value = Some(true),
            other => return Err(Violation::new(format!("boolean body {other:?} is not 0 or 1"))),
        }
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        self.value.map(Value::Bool).ok_or_else(|| Violation::new("boolean without a body"))
    }
}

/// `unicode`: one UTF-8 STRING.
pub struct UnicodeUnslicer {
    text: Option<String>,
    max_length: Option<usize>,
}

impl UnicodeUnslicer {
    /// Create from the parent's constraint for this position.
    pub fn new(constraint: Option<&Constraint>) -> Self {
        let max_length = match constraint {
            Some(Constraint::Text { max_length }) => Some(*max_length),
            _ => None,
        };
        Self { text: None, max_length }
    }
}

impl<H> Unslicer<H> for UnicodeUnslicer {
    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        if self.text.is_some() {
            return Err(Violation::new("unicode takes a single STRING"));
        }
        match token {
            TokenType::Vocab => Ok(()),
            TokenType::String => match self.max_length {
                Some(max) if size > max as u64 => {
                    Err(Violation::new(format!("unicode of {size} bytes exceeds {max}")))
                },
                _ => Ok(()),
            },
            other => Err(Violation::new(format!("unicode body must be STRING, got {}", other.name()))),
        }
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        let Value::Bytes(bytes) = child.map_err(|f| f.violation)? else {
            return Err(Violation::new("unicode body must be a string"));
        };
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| Violation::new("unicode body is not valid UTF-8"))?;
        self.text = Some(text);
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        self.text.take().map(Value::Text).ok_or_else(|| Violation::new("unicode without a body"))
    }
}

/// `vocab`: alternating INT index, STRING word. Top level only.
#[derive(Default)]
pub struct VocabUnslicer {
    entries: Dict,
    pending: Option<i128>,
}

impl<H> Unslicer<H> for VocabUnslicer {
    fn check_token(&self, token: TokenType, _size: u64) -> Result<(), Violation> {
        match (self.pending, token) {
            (None, TokenType::Int) | (Some(_), TokenType::String) => Ok(()),
            (None, other) => {
                Err(Violation::new(format!("vocab index must be INT, got {}", other.name())))
            },
            (Some(_), other) => {
                Err(Violation::new(format!("vocab word must be STRING, got {}", other.name())))
            },
        }
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, H>,
    ) -> Result<(), Violation> {
        match (self.pending.take(), child.map_err(|f| f.violation)?) {
            (None, Value::Int(index)) => self.pending = Some(index),
            (Some(index), Value::Bytes(word)) => {
                self.entries.insert(Key::Int(index), Value::Bytes(word));
            },
            (_, other) => return Err(Violation::new(format!("unexpected vocab entry {other:?}"))),
        }
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, H>) -> Result<Value, Violation> {
        if self.pending.is_some() {
            return Err(Violation::new("vocab closed between index and word"));
        }
        Ok(Value::Dict(self.entries.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        refs: References,
        registry: Registry<()>,
        host: (),
    }

    impl Harness {
        fn new() -> Self {
            Self { refs: References::default(), registry: Registry::new(), host: () }
        }

        fn cx(&mut self) -> Context<'_, ()> {
            Context { host: &mut self.host, references: &mut self.refs, registry: &self.registry }
        }
    }

    #[test]
    fn list_rejects_before_exceeding_max() {
        let constraint = Constraint::list_of(Constraint::int(), 1);
        let mut h = Harness::new();
        let mut list = ListUnslicer::new(Some(&constraint));
        Unslicer::<()>::start(&mut list, 0, &mut h.cx()).unwrap();
        assert!(Unslicer::<()>::check_token(&list, TokenType::Int, 1).is_ok());
        list.receive_child(Ok(Value::Int(1)), &mut h.cx()).unwrap();
        assert!(Unslicer::<()>::check_token(&list, TokenType::Int, 1).is_err());
    }

    #[test]
    fn dict_rejects_duplicate_keys() {
        let mut h = Harness::new();
        let mut dict = DictUnslicer::new(None);
        dict.receive_child(Ok(Value::from("a")), &mut h.cx()).unwrap();
        dict.receive_child(Ok(Value::Int(1)), &mut h.cx()).unwrap();
        assert!(dict.receive_child(Ok(Value::from("a")), &mut h.cx()).is_err());
    }

    #[test]
    fn dict_rejects_composite_keys() {
        let mut h = Harness::new();
        let mut dict = DictUnslicer::new(None);
        assert!(dict.receive_child(Ok(Value::list([])), &mut h.cx()).is_err());
    }

    #[test]
    fn reference_to_building_tuple_is_violation() {
        let mut h = Harness::new();
        let mut tuple = TupleUnslicer::new(None);
        Unslicer::<()>::start(&mut tuple, 3, &mut h.cx()).unwrap();
        let mut reference = ReferenceUnslicer::new(None);
        assert!(reference.receive_child(Ok(Value::Int(3)), &mut h.cx()).is_err());
        tuple.receive_child(Ok(Value::Int(1)), &mut h.cx()).unwrap();
        let finished = tuple.receive_close(&mut h.cx()).unwrap();
        let mut reference = ReferenceUnslicer::new(None);
        reference.receive_child(Ok(Value::Int(3)), &mut h.cx()).unwrap();
        assert_eq!(reference.receive_close(&mut h.cx()).unwrap(), finished);
    }

    #[test]
    fn unicode_rejects_invalid_utf8() {
        let mut h = Harness::new();
        let mut text = UnicodeUnslicer::new(None);
        let bad = Value::Bytes(Bytes::from_static(&[0xff, 0xfe]));
        assert!(text.receive_child(Ok(bad), &mut h.cx()).is_err());
    }

    #[test]
    fn boolean_only_accepts_zero_or_one() {
        let mut h = Harness::new();
        let b = BooleanUnslicer::default();
        assert!(Unslicer::<()>::check_token(&b, TokenType::Int, 2).is_err());
        let mut b = BooleanUnslicer::default();
        b.receive_child(Ok(Value::Int(1)), &mut h.cx()).unwrap();
        assert_eq!(b.receive_close(&mut h.cx()).unwrap(), Value::Bool(true));
    }

    #[test]
    fn narrow_digs_through_choice_and_optional() {
        let list = Constraint::list_of(Constraint::int(), 4);
        let c = Constraint::optional(Constraint::Choice(vec![Constraint::int(), list.clone()]));
        assert_eq!(narrow(Some(&c), "list"), Some(&list));
        assert_eq!(narrow(Some(&Constraint::Any), "list"), None);
    }
}
