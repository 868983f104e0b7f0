//! Outbound serialization strategies.
//!
//! A slicer turns one composite value into a sequence of child values. The
//! send pump owns a stack of slicers and pulls children from the top one;
//! primitive children are written as tokens, composite children push a new
//! slicer. A slicer is therefore an explicit continuation: its state is
//! exactly "what is left to emit".

use std::vec;

use banana_proto::Violation;
use bytes::Bytes;

use crate::value::{Dict, List, ObjectRef, Tuple, Value};

/// Connection-specific behaviour plugged into the codec.
///
/// The host owns whatever tables a protocol layered on Banana needs (the
/// broker's object tables, for instance). Unslicers reach it through
/// [`crate::Context::host`]; the send pump asks it to slice
/// [`Value::Object`]s.
pub trait Host: Send + Sized + 'static {
    /// Produce a slicer for a host object.
    fn slice_object(&mut self, object: &ObjectRef) -> Result<Box<dyn Slicer<Self>>, Violation> {
        Err(Violation::new(format!("cannot serialize {}", object.type_name())))
    }

    /// An object of `opentype` was discarded without being decoded; `first`
    /// is its leading INT child.
    ///
    /// Hosts that count references carried in such objects release them
    /// here, since no unslicer will ever see them.
    fn skipped(&mut self, opentype: &[u8], first: u64) {
        let _ = (opentype, first);
    }
}

/// Plain codec host with no objects of its own.
impl Host for () {}

/// Encoder state for one composite value.
pub trait Slicer<H>: Send {
    /// Opentype announced after OPEN, or `None` for no OPEN/CLOSE wrapper.
    fn opentype(&self) -> Option<&'static str>;

    /// Next child to emit, or `None` once the value is complete.
    fn next_child(&mut self, host: &mut H) -> Result<Option<Value>, Violation>;

    /// A child of this slicer was aborted.
    ///
    /// Returning `Ok` absorbs the failure and keeps slicing; returning the
    /// violation aborts this slicer too.
    fn child_aborted(&mut self, violation: Violation) -> Result<(), Violation> {
        Err(violation)
    }
}

/// Slices a list snapshot.
pub struct ListSlicer {
    items: vec::IntoIter<Value>,
}

impl ListSlicer {
    /// Slice `list` as it is right now.
    pub fn new(list: &List) -> Self {
        Self { items: list.snapshot().into_iter() }
    }
}

impl<H> Slicer<H> for ListSlicer {
    fn opentype(&self) -> Option<&'static str> {
        Some("list")
    }

    fn next_child(&mut self, _host: &mut H) -> Result<Option<Value>, Violation> {
        Ok(self.items.next())
    }
}

/// Slices a tuple.
pub struct TupleSlicer {
    items: vec::IntoIter<Value>,
}

impl TupleSlicer {
    /// Slice `tuple`.
    pub fn new(tuple: &Tuple) -> Self {
        Self { items: tuple.items().to_vec().into_iter() }
    }
}

impl<H> Slicer<H> for TupleSlicer {
    fn opentype(&self) -> Option<&'static str> {
        Some("tuple")
    }

    fn next_child(&mut self, _host: &mut H) -> Result<Option<Value>, Violation> {
        Ok(self.items.next())
    }
}

/// Slices a dict as alternating key, value children in key order.
pub struct DictSlicer {
    entries: vec::IntoIter<Value>,
}

impl DictSlicer {
    /// Slice `dict` as it is right now.
    pub fn new(dict: &Dict) -> Self {
        let entries: Vec<Value> =
            dict.snapshot().into_iter().flat_map(|(k, v)| [Value::from(k), v]).collect();
        Self { entries: entries.into_iter() }
    }
}

impl<H> Slicer<H> for DictSlicer {
    fn opentype(&self) -> Option<&'static str> {
        Some("dict")
    }

    fn next_child(&mut self, _host: &mut H) -> Result<Option<Value>, Violation> {
        Ok(self.entries.next())
    }
}

/// Emits a fixed sequence of children under one opentype.
///
/// Covers every opentype whose body is a short list of primitives:
/// `none` (no children), `boolean` (one INT), `unicode` (one STRING),
/// `reference` (one INT), and host messages built the same way.
pub struct FixedSlicer {
    opentype: &'static str,
    children: vec::IntoIter<Value>,
}

impl FixedSlicer {
    /// Slice `children` under `opentype`.
    pub fn new(opentype: &'static str, children: Vec<Value>) -> Self {
        Self { opentype, children: children.into_iter() }
    }

    /// `none`
    pub fn none() -> Self {
        Self::new("none", Vec::new())
    }

    /// `boolean` with an INT body of 0 or 1
    pub fn boolean(value: bool) -> Self {
        Self::new("boolean", vec![Value::Int(i128::from(value))])
    }

    /// `unicode` with a UTF-8 STRING body
    pub fn unicode(text: &str) -> Self {
        Self::new("unicode", vec![Value::Bytes(Bytes::copy_from_slice(text.as_bytes()))])
    }

    /// `reference` naming an earlier OPEN index
    pub fn reference(index: u64) -> Self {
        Self::new("reference", vec![Value::Int(i128::from(index))])
    }
}

impl<H> Slicer<H> for FixedSlicer {
    fn opentype(&self) -> Option<&'static str> {
        Some(self.opentype)
    }

    fn next_child(&mut self, _host: &mut H) -> Result<Option<Value>, Violation> {
        Ok(self.children.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Key;

    fn drain(slicer: &mut dyn Slicer<()>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(v) = slicer.next_child(&mut ()).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn dict_alternates_sorted_keys_and_values() {
        let dict = Dict::new(
            [(Key::from("b"), Value::Int(2)), (Key::from("a"), Value::Int(1))].into_iter().collect(),
        );
        let mut slicer = DictSlicer::new(&dict);
        assert_eq!(
            drain(&mut slicer),
            vec![Value::from("a"), Value::Int(1), Value::from("b"), Value::Int(2)]
        );
    }

    #[test]
    fn list_snapshot_is_taken_at_creation() {
        let list = List::new(vec![Value::Int(1)]);
        let mut slicer = ListSlicer::new(&list);
        list.push(Value::Int(2));
        assert_eq!(drain(&mut slicer), vec![Value::Int(1)]);
    }

    #[test]
    fn boolean_body_is_an_int() {
        let mut slicer = FixedSlicer::boolean(true);
        assert_eq!(Slicer::<()>::opentype(&slicer), Some("boolean"));
        assert_eq!(drain(&mut slicer), vec![Value::Int(1)]);
    }

    #[test]
    fn default_child_abort_propagates() {
        let mut slicer = FixedSlicer::none();
        let result = Slicer::<()>::child_aborted(&mut slicer, Violation::new("x"));
        assert_eq!(result, Err(Violation::new("x")));
    }
}
