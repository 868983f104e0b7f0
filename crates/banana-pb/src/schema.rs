//! Remote interfaces and argument binding.
//!
//! An interface names a set of methods, each with ordered, constrained
//! arguments and an optional result constraint. Callers use it to reject
//! bad calls before anything is written; servers use it to constrain the
//! tokens of an inbound call as they arrive.
//!
//! Arguments always travel as name/value pairs sorted by name. Positional
//! arguments the caller cannot name travel under their decimal position
//! (`"0"`, `"1"`, ...); a server with a schema renames them to the
//! declared names.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use banana_core::{Constraint, Value, Violation};

use crate::{error::CallError, failure::Failure};

/// One remotely callable method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSchema {
    name: String,
    args: Vec<(String, Constraint)>,
    result: Option<Constraint>,
}

impl MethodSchema {
    /// Method with no arguments and an unconstrained result.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), args: Vec::new(), result: None }
    }

    /// Append a required argument.
    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, constraint: Constraint) -> Self {
        self.args.push((name.into(), constraint));
        self
    }

    /// Constrain the result.
    #[must_use]
    pub fn returns(mut self, constraint: Constraint) -> Self {
        self.result = Some(constraint);
        self
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared arguments in positional order.
    pub fn args(&self) -> &[(String, Constraint)] {
        &self.args
    }

    /// Result constraint, if any.
    pub fn result(&self) -> Option<&Constraint> {
        self.result.as_ref()
    }

    /// Constraint for an argument that has already been renamed.
    pub fn arg_constraint(&self, name: &str) -> Option<&Constraint> {
        self.args.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Map a wire argument name to its declared name.
    pub fn resolve_name(&self, wire_name: &str) -> Result<String, Violation> {
        if let Ok(position) = wire_name.parse::<usize>() {
            return self.args.get(position).map(|(n, _)| n.clone()).ok_or_else(|| {
                Violation::new(format!("{} takes {} arguments, got position {position}", self.name, self.args.len()))
            });
        }
        if self.arg_constraint(wire_name).is_some() {
            Ok(wire_name.to_string())
        } else {
            Err(Violation::new(format!("{} has no argument {wire_name:?}", self.name)))
        }
    }

    /// Bind and check caller arguments against this schema.
    pub fn bind(&self, args: CallArgs) -> Result<BTreeMap<String, Value>, CallError> {
        if args.positional.len() > self.args.len() {
            return Err(Violation::new(format!(
                "{} takes {} arguments, got {} positional",
                self.name,
                self.args.len(),
                args.positional.len()
            ))
            .into());
        }
        let mut bound = BTreeMap::new();
        for ((name, _), value) in self.args.iter().zip(args.positional) {
            bound.insert(name.clone(), value);
        }
        for (name, value) in args.named {
            if self.arg_constraint(&name).is_none() {
                return Err(Violation::new(format!("{} has no argument {name:?}", self.name)).into());
            }
            if bound.insert(name.clone(), value).is_some() {
                return Err(Violation::new(format!("argument {name:?} given twice")).into());
            }
        }
        for (name, constraint) in &self.args {
            let value = bound
                .get(name)
                .ok_or_else(|| Violation::new(format!("{} missing argument {name:?}", self.name)))?;
            constraint.check_value(value).map_err(|v| v.at(format!("{}.{name}", self.name)))?;
        }
        Ok(bound)
    }

    /// Check an inbound argument set is complete.
    pub fn check_complete(&self, args: &BTreeMap<String, Value>) -> Result<(), Violation> {
        match self.args.iter().find(|(name, _)| !args.contains_key(name)) {
            Some((name, _)) => Err(Violation::new(format!("{} missing argument {name:?}", self.name))),
            None => Ok(()),
        }
    }
}

/// A named set of methods.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceSchema {
    name: String,
    methods: BTreeMap<String, MethodSchema>,
}

impl InterfaceSchema {
    /// Interface with no methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), methods: BTreeMap::new() }
    }

    /// Add a method.
    #[must_use]
    pub fn method(mut self, method: MethodSchema) -> Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    /// Interface name, sent with `my-reference`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method.
    pub fn get(&self, method: &str) -> Option<&MethodSchema> {
        self.methods.get(method)
    }

    /// Look up a method, failing the way `call_remote` reports it.
    pub fn require(&self, method: &str) -> Result<&MethodSchema, CallError> {
        self.get(method).ok_or_else(|| CallError::UnknownMethod {
            interface: self.name.clone(),
            method: method.to_string(),
        })
    }
}

/// Interfaces known to this process, by name. Read-only once shared.
#[derive(Debug, Clone, Default)]
pub struct InterfaceRegistry {
    interfaces: HashMap<String, Arc<InterfaceSchema>>,
}

impl InterfaceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface under its name.
    pub fn register(&mut self, interface: InterfaceSchema) -> Arc<InterfaceSchema> {
        let interface = Arc::new(interface);
        self.interfaces.insert(interface.name.clone(), Arc::clone(&interface));
        interface
    }

    /// Look up an interface.
    pub fn get(&self, name: &str) -> Option<Arc<InterfaceSchema>> {
        self.interfaces.get(name).cloned()
    }
}

/// Arguments for an outbound call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
    result: Option<Constraint>,
}

impl CallArgs {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Add a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.push((name.into(), value.into()));
        self
    }

    /// Override the result constraint for this call.
    #[must_use]
    pub fn result_constraint(mut self, constraint: Constraint) -> Self {
        self.result = Some(constraint);
        self
    }

    pub(crate) fn take_result_constraint(&mut self) -> Option<Constraint> {
        self.result.take()
    }

    /// Bind without a schema: positional arguments are named by position.
    pub fn bind_unchecked(self) -> Result<BTreeMap<String, Value>, CallError> {
        let mut bound: BTreeMap<String, Value> =
            self.positional.into_iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect();
        for (name, value) in self.named {
            if bound.insert(name.clone(), value).is_some() {
                return Err(Violation::new(format!("argument {name:?} given twice")).into());
            }
        }
        Ok(bound)
    }
}

/// Arguments of an inbound call, by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(BTreeMap<String, Value>);

impl Arguments {
    /// Wrap named arguments.
    pub fn new(args: BTreeMap<String, Value>) -> Self {
        Self(args)
    }

    /// Argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Argument by name, falling back to its position for callers that
    /// sent it unnamed.
    pub fn arg(&self, name: &str, position: usize) -> Result<&Value, Failure> {
        self.0
            .get(name)
            .or_else(|| self.0.get(&position.to_string()))
            .ok_or_else(|| Failure::new("TypeError", format!("missing argument {name:?}")))
    }

    /// Integer argument, see [`Arguments::arg`].
    pub fn int(&self, name: &str, position: usize) -> Result<i128, Failure> {
        self.arg(name, position)?
            .as_int()
            .ok_or_else(|| Failure::new("TypeError", format!("argument {name:?} must be an integer")))
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Arguments in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> MethodSchema {
        MethodSchema::new("add").arg("a", Constraint::int()).arg("b", Constraint::int())
    }

    #[test]
    fn positional_arguments_take_declared_names() {
        let bound = add().bind(CallArgs::new().arg(2).arg(3)).unwrap();
        assert_eq!(bound.get("a"), Some(&Value::Int(2)));
        assert_eq!(bound.get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn ill_typed_argument_rejected() {
        let err = add().bind(CallArgs::new().arg(2).arg("three")).unwrap_err();
        assert!(matches!(err, CallError::Violation(_)));
    }

    #[test]
    fn missing_and_extra_arguments_rejected() {
        assert!(add().bind(CallArgs::new().arg(1)).is_err());
        assert!(add().bind(CallArgs::new().arg(1).arg(2).arg(3)).is_err());
        assert!(add().bind(CallArgs::new().arg(1).arg(2).kwarg("c", 3)).is_err());
        assert!(add().bind(CallArgs::new().arg(1).arg(2).kwarg("a", 3)).is_err());
    }

    #[test]
    fn unchecked_binding_uses_positions() {
        let bound = CallArgs::new().arg(1).kwarg("x", 2).bind_unchecked().unwrap();
        let names: Vec<&String> = bound.keys().collect();
        assert_eq!(names, ["0", "x"]);
    }

    #[test]
    fn wire_names_resolve_through_schema() {
        assert_eq!(add().resolve_name("1").unwrap(), "b");
        assert_eq!(add().resolve_name("a").unwrap(), "a");
        assert!(add().resolve_name("2").is_err());
        assert!(add().resolve_name("c").is_err());
    }

    #[test]
    fn unknown_method_names_interface() {
        let iface = InterfaceSchema::new("Calculator").method(add());
        assert!(iface.require("add").is_ok());
        assert_eq!(
            iface.require("nonexistent").unwrap_err(),
            CallError::UnknownMethod { interface: "Calculator".into(), method: "nonexistent".into() }
        );
    }

    #[test]
    fn arguments_fall_back_to_position() {
        let args = Arguments::new([("0".to_string(), Value::Int(4))].into_iter().collect());
        assert_eq!(args.int("a", 0), Ok(4));
        assert!(args.int("b", 1).is_err());
    }
}
