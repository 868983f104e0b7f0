//! Opentype registry.
//!
//! Maps the first index token of an OPEN to a factory that builds the
//! unslicer for it. Two tables exist: nested opentypes (anything below the
//! root) and top-level opentypes (direct children of the root). A protocol
//! layered on the codec registers its own message types in the top-level
//! table, so a `call` buried inside a list is refused as unknown.

use std::{collections::HashMap, fmt, sync::Arc};

use banana_proto::Violation;
use bytes::Bytes;

use crate::{
    constraint::Constraint,
    unslicer::{
        BooleanUnslicer, DictUnslicer, ListUnslicer, NoneUnslicer, ReferenceUnslicer,
        TupleUnslicer, UnicodeUnslicer, Unslicer, VocabUnslicer, narrow,
    },
};

/// Opentype name of the vocabulary-table message.
pub const VOCAB_OPENTYPE: &str = "vocab";

/// Builds an unslicer from the index tokens collected so far.
///
/// Returning `Ok(None)` asks the codec for one more index token (two-phase
/// opens such as `("copyable", classname)`).
pub type Factory<H> = Arc<
    dyn Fn(&[Bytes], Option<&Constraint>) -> Result<Option<Box<dyn Unslicer<H>>>, Violation>
        + Send
        + Sync,
>;

/// Opentype name → unslicer factory.
pub struct Registry<H> {
    nested: HashMap<String, Factory<H>>,
    top_level: HashMap<String, Factory<H>>,
}

impl<H: 'static> Registry<H> {
    /// Registry with the standard opentypes, nested and at top level, plus
    /// `vocab` at top level.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_builtins();
        for (name, factory) in registry.nested.clone() {
            registry.top_level.insert(name, factory);
        }
        registry.register_vocab();
        registry
    }

    /// Accept the vocabulary table as a top-level object.
    pub fn register_vocab(&mut self) {
        self.register_top_level(VOCAB_OPENTYPE, simple(|_| Box::new(VocabUnslicer::default())));
    }

    /// Register the standard opentypes in the nested table.
    pub fn register_builtins(&mut self) {
        self.register("list", simple(|c| Box::new(ListUnslicer::new(c))));
        self.register("tuple", simple(|c| Box::new(TupleUnslicer::new(c))));
        self.register("dict", simple(|c| Box::new(DictUnslicer::new(c))));
        self.register("reference", simple(|c| Box::new(ReferenceUnslicer::new(c))));
        self.register("none", simple(|_| Box::new(NoneUnslicer)));
        self.register("boolean", simple(|_| Box::new(BooleanUnslicer::default())));
        self.register("unicode", simple(|c| Box::new(UnicodeUnslicer::new(c))));
    }
}

impl<H> Registry<H> {
    /// Registry with nothing registered.
    pub fn empty() -> Self {
        Self { nested: HashMap::new(), top_level: HashMap::new() }
    }

    /// Register a nested opentype.
    pub fn register(&mut self, name: impl Into<String>, factory: Factory<H>) {
        self.nested.insert(name.into(), factory);
    }

    /// Register an opentype accepted only as a direct child of the root.
    pub fn register_top_level(&mut self, name: impl Into<String>, factory: Factory<H>) {
        self.top_level.insert(name.into(), factory);
    }

    pub(crate) fn open_nested(
        &self,
        index: &[Bytes],
        constraint: Option<&Constraint>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        Self::open_in(&self.nested, index, constraint)
    }

    pub(crate) fn open_top_level(
        &self,
        index: &[Bytes],
        constraint: Option<&Constraint>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        // the vocabulary table is connection plumbing, not application data
        let constraint = if opentype_name(index)? == VOCAB_OPENTYPE { None } else { constraint };
        Self::open_in(&self.top_level, index, constraint)
    }

    fn open_in(
        table: &HashMap<String, Factory<H>>,
        index: &[Bytes],
        constraint: Option<&Constraint>,
    ) -> Result<Option<Box<dyn Unslicer<H>>>, Violation> {
        let name = opentype_name(index)?;
        if let Some(constraint) = constraint {
            constraint.check_opentype(name)?;
        }
        let factory = table
            .get(name)
            .ok_or_else(|| Violation::new(format!("unknown opentype {name:?}")))?;
        factory(index, narrow(constraint, name))
    }
}

impl<H: 'static> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for Registry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nested: Vec<&String> = self.nested.keys().collect();
        let mut top_level: Vec<&String> = self.top_level.keys().collect();
        nested.sort();
        top_level.sort();
        f.debug_struct("Registry").field("nested", &nested).field("top_level", &top_level).finish()
    }
}

/// Factory for opentypes that need exactly one index token.
pub fn simple<H: 'static, F>(build: F) -> Factory<H>
where
    F: Fn(Option<&Constraint>) -> Box<dyn Unslicer<H>> + Send + Sync + 'static,
{
    Arc::new(
        move |_index: &[Bytes],
              constraint: Option<&Constraint>|
              -> Result<Option<Box<dyn Unslicer<H>>>, Violation> { Ok(Some(build(constraint))) },
    )
}

/// First index token as an opentype name.
pub fn opentype_name(index: &[Bytes]) -> Result<&str, Violation> {
    let first = index.first().ok_or_else(|| Violation::new("OPEN without an index token"))?;
    std::str::from_utf8(first).map_err(|_| Violation::new("opentype name is not UTF-8"))
}
