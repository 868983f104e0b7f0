//! Methods that answer later: the connection keeps serving other calls
//! while an answer is outstanding.

use std::sync::{Arc, Mutex};

use banana_core::{Deferred, Value, Violation};
use banana_harness::{BrokerPair, fixtures};
use banana_pb::{CallArgs, CallError, MethodTable, Referenceable};

fn slow_root(slot: &Arc<Mutex<Vec<Deferred>>>) -> Arc<dyn Referenceable> {
    let slot = Arc::clone(slot);
    MethodTable::new()
        .method("slow", move |_| {
            let deferred = Deferred::new();
            slot.lock().unwrap().push(deferred.clone());
            Ok(Value::Deferred(deferred))
        })
        .method("add", |args| Ok(Value::Int(args.int("a", 0)? + args.int("b", 1)?)))
        .build()
}

#[test]
fn deferred_answer_does_not_block_other_calls() {
    let slot = Arc::new(Mutex::new(Vec::new()));
    let mut pair = BrokerPair::new(fixtures::calculator(), slow_root(&slot));
    let root = pair.client().root();

    let mut slow = pair.client().call_remote(&root, "slow", CallArgs::new()).unwrap();
    let mut fast = pair.client().call_remote(&root, "add", CallArgs::new().arg(1).arg(2)).unwrap();
    pair.settle();

    assert_eq!(fast.try_result(), Some(Ok(Value::Int(3))));
    assert_eq!(slow.try_result(), None);
    assert_eq!(pair.server().held_answers(), 1);

    slot.lock().unwrap()[0].resolve(Value::Int(42));
    pair.settle();
    assert_eq!(slow.try_result(), Some(Ok(Value::Int(42))));
    assert_eq!(pair.server().held_answers(), 0);
}

#[test]
fn failed_deferred_becomes_remote_failure() {
    let slot = Arc::new(Mutex::new(Vec::new()));
    let mut pair = BrokerPair::new(fixtures::calculator(), slow_root(&slot));
    let root = pair.client().root();

    let mut slow = pair.client().call_remote(&root, "slow", CallArgs::new()).unwrap();
    pair.settle();
    slot.lock().unwrap()[0].fail(Violation::new("gave up"));
    pair.settle();

    let Some(Err(CallError::Remote(failure))) = slow.try_result() else {
        panic!("expected a remote failure");
    };
    assert_eq!(failure.type_name, "Violation");
    assert_eq!(failure.message, "gave up");
}

#[test]
fn cancelled_call_discards_late_answer() {
    let slot = Arc::new(Mutex::new(Vec::new()));
    let mut pair = BrokerPair::new(fixtures::calculator(), slow_root(&slot));
    let root = pair.client().root();

    let mut slow = pair.client().call_remote(&root, "slow", CallArgs::new()).unwrap();
    pair.settle();
    slow.cancel();
    assert_eq!(slow.try_result(), Some(Err(CallError::Cancelled)));

    slot.lock().unwrap()[0].resolve(Value::Int(1));
    pair.settle();
    assert_eq!(slow.try_result(), Some(Err(CallError::Cancelled)));
    assert_eq!(pair.client().pending_calls(), 0);
}
