#![no_main]

use banana_proto::{MAX_HEADER_LENGTH, decode_header, find_type_byte};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some(position)) = find_type_byte(data) {
        assert!(position <= MAX_HEADER_LENGTH);
        let _ = decode_header(&data[..position]);
    }
});
