#![no_main]

//! Arbitrary bytes through the plain codec, whole and split in two. Both
//! deliveries must agree.

use std::sync::Arc;

use banana_core::{Banana, BananaConfig, Registry};
use libfuzzer_sys::fuzz_target;

fn decode(chunks: &[&[u8]]) -> Option<usize> {
    let mut banana = Banana::new(BananaConfig::default(), Arc::new(Registry::<()>::new()), ());
    let mut delivered = 0;
    for chunk in chunks {
        delivered += banana.data_received(chunk).ok()?.len();
    }
    Some(delivered)
}

fuzz_target!(|data: &[u8]| {
    let whole = decode(&[data]);
    if data.len() > 1 {
        let (head, tail) = data.split_at(data.len() / 2);
        assert_eq!(decode(&[head, tail]), whole);
    }
});
