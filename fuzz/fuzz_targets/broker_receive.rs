#![no_main]

//! Arbitrary bytes into a broker, seven at a time. It may drop the
//! connection but must never panic.

use banana_pb::{Broker, BrokerAction, BrokerConfig, MethodTable};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let root = MethodTable::new().method("echo", |args| Ok(args.arg("value", 0)?.clone())).build();
    let mut broker = Broker::new(BrokerConfig::default(), root);
    for chunk in data.chunks(7) {
        for action in broker.data_received(chunk) {
            if let BrokerAction::LoseConnection { .. } = action {
                assert!(!broker.is_connected());
            }
        }
    }
});
