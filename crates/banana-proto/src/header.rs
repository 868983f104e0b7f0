//! Base-128 token headers.
//!
//! Digits are written least significant first, seven bits per byte, high bit
//! clear. Zero is written as a single `0x00` digit. An empty header (as used
//! by FLOAT) decodes to zero.

use bytes::BufMut;

use crate::errors::BananaError;

/// Maximum number of header digits before a type byte must appear.
pub const MAX_HEADER_LENGTH: usize = 64;

/// Append the base-128 digits of `value` to `out`.
pub fn encode_header(mut value: u64, out: &mut impl BufMut) {
    if value == 0 {
        out.put_u8(0);
        return;
    }
    while value > 0 {
        out.put_u8((value & 0x7f) as u8);
        value >>= 7;
    }
}

/// Decode header digits (without the type byte).
///
/// Leading zero digits in the high positions are tolerated; a value that
/// needs more than 64 bits is a fatal error.
pub fn decode_header(digits: &[u8]) -> Result<u64, BananaError> {
    let mut value: u64 = 0;
    for (position, &digit) in digits.iter().enumerate() {
        debug_assert!(digit < 0x80, "header digit with high bit set");
        if digit == 0 {
            continue;
        }
        let shift = position * 7;
        if shift >= 64 {
            return Err(BananaError::HeaderOverflow);
        }
        let part = u64::from(digit) << shift;
        if part >> shift != u64::from(digit) {
            return Err(BananaError::HeaderOverflow);
        }
        value |= part;
    }
    Ok(value)
}

/// Find the type byte in `buffer`.
///
/// Returns the position of the first byte with the high bit set, `None` if
/// more data is needed, or an error once [`MAX_HEADER_LENGTH`] digits have
/// been seen without a type byte.
pub fn find_type_byte(buffer: &[u8]) -> Result<Option<usize>, BananaError> {
    let window = &buffer[..buffer.len().min(MAX_HEADER_LENGTH + 1)];
    match window.iter().position(|b| b & 0x80 != 0) {
        Some(position) => Ok(Some(position)),
        None if buffer.len() > MAX_HEADER_LENGTH => {
            Err(BananaError::HeaderTooLong { limit: MAX_HEADER_LENGTH })
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    fn encoded(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_header(value, &mut out);
        out
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encoded(0), hex!("00"));
        assert_eq!(encoded(1), hex!("01"));
        assert_eq!(encoded(127), hex!("7f"));
        assert_eq!(encoded(128), hex!("00 01"));
        assert_eq!(encoded(300), hex!("2c 02"));
    }

    #[test]
    fn empty_header_is_zero() {
        assert_eq!(decode_header(&[]), Ok(0));
    }

    #[test]
    fn overflow_is_fatal() {
        let digits = [0x7f; 10];
        assert_eq!(decode_header(&digits), Err(BananaError::HeaderOverflow));
    }

    #[test]
    fn max_u64_fits() {
        assert_eq!(decode_header(&encoded(u64::MAX)), Ok(u64::MAX));
    }

    #[test]
    fn type_byte_search() {
        assert_eq!(find_type_byte(&hex!("05 82 41")), Ok(Some(1)));
        assert_eq!(find_type_byte(&hex!("05 01")), Ok(None));
        assert_eq!(find_type_byte(&[0u8; MAX_HEADER_LENGTH]), Ok(None));
        assert_eq!(
            find_type_byte(&[0u8; MAX_HEADER_LENGTH + 1]),
            Err(BananaError::HeaderTooLong { limit: MAX_HEADER_LENGTH })
        );
    }

    proptest! {
        #[test]
        fn header_roundtrip(value in any::<u64>()) {
            let digits = encoded(value);
            prop_assert!(digits.iter().all(|b| b & 0x80 == 0));
            prop_assert_eq!(decode_header(&digits), Ok(value));
        }
    }
}
