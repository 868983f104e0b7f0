//! Objects shared by the scenario tests.

use std::sync::Arc;

use banana_core::{Constraint, Value};
use banana_pb::{Failure, InterfaceRegistry, InterfaceSchema, MethodSchema, MethodTable, Referenceable};

/// Interface name of [`calculator`].
pub const CALCULATOR: &str = "Calculator";

/// `add(a: int, b: int) -> int` and `fail()`.
pub fn calculator_interface() -> InterfaceSchema {
    InterfaceSchema::new(CALCULATOR)
        .method(
            MethodSchema::new("add")
                .arg("a", Constraint::int())
                .arg("b", Constraint::int())
                .returns(Constraint::int()),
        )
        .method(MethodSchema::new("fail"))
}

/// Registry holding [`calculator_interface`].
pub fn interfaces() -> Arc<InterfaceRegistry> {
    let mut registry = InterfaceRegistry::new();
    registry.register(calculator_interface());
    Arc::new(registry)
}

/// A calculator without an interface: nothing is checked on either side.
pub fn calculator() -> Arc<dyn Referenceable> {
    calculator_table().build()
}

/// A calculator that enforces [`calculator_interface`] on inbound calls.
pub fn checked_calculator(interfaces: &InterfaceRegistry) -> Arc<dyn Referenceable> {
    match interfaces.get(CALCULATOR) {
        Some(interface) => calculator_table().with_interface(interface).build(),
        None => calculator(),
    }
}

fn calculator_table() -> MethodTable {
    MethodTable::new()
        .method("add", |args| Ok(Value::Int(args.int("a", 0)? + args.int("b", 1)?)))
        .method("fail", |_| Err(Failure::new("ValueError", "always fails").with_traceback("in fail")))
}
