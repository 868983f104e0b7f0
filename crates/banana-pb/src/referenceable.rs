//! Objects this side exposes to the peer.

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use banana_core::{Object, ObjectRef, Value};

use crate::{failure::Failure, schema::Arguments, schema::InterfaceSchema};

/// An object whose methods the peer may call.
///
/// Returning [`Value::Deferred`] answers the call once the deferred
/// settles; the connection keeps serving other traffic meanwhile.
pub trait Referenceable: Send + Sync + 'static {
    /// Interface announced with `my-reference` and used to constrain
    /// inbound calls.
    fn interface(&self) -> Option<Arc<InterfaceSchema>> {
        None
    }

    /// Run `method`.
    fn remote_call(&self, method: &str, args: &Arguments) -> Result<Value, Failure>;
}

type Handler = Arc<dyn Fn(&Arguments) -> Result<Value, Failure> + Send + Sync>;

/// A [`Referenceable`] assembled from closures.
#[derive(Clone, Default)]
pub struct MethodTable {
    interface: Option<Arc<InterfaceSchema>>,
    handlers: HashMap<String, Handler>,
}

impl MethodTable {
    /// Table with no methods and no interface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce and enforce `interface`.
    #[must_use]
    pub fn with_interface(mut self, interface: Arc<InterfaceSchema>) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Add a method.
    #[must_use]
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Value, Failure> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Finish building.
    pub fn build(self) -> Arc<dyn Referenceable> {
        Arc::new(self)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("MethodTable")
            .field("interface", &self.interface.as_ref().map(|i| i.name()))
            .field("methods", &methods)
            .finish()
    }
}

impl Referenceable for MethodTable {
    fn interface(&self) -> Option<Arc<InterfaceSchema>> {
        self.interface.clone()
    }

    fn remote_call(&self, method: &str, args: &Arguments) -> Result<Value, Failure> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| Failure::new("AttributeError", format!("no method {method:?}")))?;
        handler(args)
    }
}

/// A local object travelling inside a value.
///
/// Sending it gives the peer a `my-reference`; a `your-reference` from the
/// peer decodes back to the same object.
#[derive(Clone)]
pub struct LocalObject(pub(crate) Arc<dyn Referenceable>);

impl LocalObject {
    /// The exposed object.
    pub fn object(&self) -> &Arc<dyn Referenceable> {
        &self.0
    }

    /// Extract a local object from a decoded value.
    pub fn from_value(value: &Value) -> Option<Arc<dyn Referenceable>> {
        match value {
            Value::Object(object) => object.downcast::<LocalObject>().map(|l| Arc::clone(&l.0)),
            _ => None,
        }
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.0.interface().map(|i| i.name().to_string());
        f.debug_tuple("LocalObject").field(&name).finish()
    }
}

impl Object for LocalObject {
    fn type_name(&self) -> &'static str {
        "LocalObject"
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Wrap a local object so it can be passed as an argument or result.
pub fn export(object: Arc<dyn Referenceable>) -> Value {
    Value::Object(ObjectRef::new(Arc::new(LocalObject(object))))
}

/// Address of an exposed object, stable while the `Arc` is alive.
pub(crate) fn identity(object: &Arc<dyn Referenceable>) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_table_dispatches_by_name() {
        let table = MethodTable::new()
            .method("add", |args| Ok(Value::Int(args.int("a", 0)? + args.int("b", 1)?)))
            .build();
        let args = Arguments::new(
            [("0".to_string(), Value::Int(2)), ("1".to_string(), Value::Int(3))].into_iter().collect(),
        );
        assert_eq!(table.remote_call("add", &args), Ok(Value::Int(5)));
        let missing = table.remote_call("sub", &args).unwrap_err();
        assert_eq!(missing.type_name, "AttributeError");
    }

    #[test]
    fn exported_object_comes_back_out() {
        let table = MethodTable::new().build();
        let value = export(Arc::clone(&table));
        let back = LocalObject::from_value(&value).unwrap();
        assert_eq!(identity(&back), identity(&table));
    }
}
