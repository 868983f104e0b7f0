//! Integer encoding and the INT/LONGINT cutover.
//!
//! Values in `-2^31 ..= 2^31 - 1` travel as INT (non-negative, header is the
//! value) or NEG (header is the magnitude, so `-2^31` is NEG with header
//! `2^31`). Everything else travels as LONGINT/LONGNEG with a minimal
//! big-endian magnitude body. Decoded values are `i128`; anything wider is
//! rejected.

use crate::{errors::Violation, token::TokenType};

/// First magnitude that no longer fits in an INT token.
pub const INT_CUTOVER: i128 = 1 << 31;

/// Largest LONGINT/LONGNEG body accepted when decoding into `i128`.
pub const MAX_LONG_BODY: usize = 16;

/// How an integer is laid out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntToken {
    /// INT or NEG with the magnitude in the header
    Short {
        /// INT or NEG
        token: TokenType,
        /// Magnitude
        magnitude: u64,
    },
    /// LONGINT or LONGNEG with a big-endian magnitude body
    Long {
        /// LONGINT or LONGNEG
        token: TokenType,
        /// Minimal big-endian magnitude
        body: Vec<u8>,
    },
}

impl IntToken {
    /// Choose the encoding for `value`.
    pub fn for_value(value: i128) -> Self {
        if (-INT_CUTOVER..INT_CUTOVER).contains(&value) {
            let token = if value >= 0 { TokenType::Int } else { TokenType::Neg };
            Self::Short { token, magnitude: value.unsigned_abs() as u64 }
        } else {
            let token = if value >= 0 { TokenType::LongInt } else { TokenType::LongNeg };
            Self::Long { token, body: magnitude_to_bytes(value.unsigned_abs()) }
        }
    }
}

/// Minimal big-endian encoding of a magnitude. Zero encodes as one `0x00`.
pub fn magnitude_to_bytes(magnitude: u128) -> Vec<u8> {
    let bytes = magnitude.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

/// Decode a big-endian magnitude body.
pub fn magnitude_from_bytes(body: &[u8]) -> Result<u128, Violation> {
    let significant = match body.iter().position(|&b| b != 0) {
        Some(first) => &body[first..],
        None => return Ok(0),
    };
    if significant.len() > MAX_LONG_BODY {
        return Err(Violation::new(format!(
            "long integer of {} bytes exceeds {MAX_LONG_BODY}",
            significant.len()
        )));
    }
    Ok(significant.iter().fold(0u128, |acc, &b| (acc << 8) | u128::from(b)))
}

/// Apply the sign carried by the token type to a decoded magnitude.
pub fn signed(magnitude: u128, negative: bool) -> Result<i128, Violation> {
    if negative {
        if magnitude == i128::MIN.unsigned_abs() {
            return Ok(i128::MIN);
        }
        i128::try_from(magnitude)
            .map(|m| -m)
            .map_err(|_| Violation::new("negative integer out of range"))
    } else {
        i128::try_from(magnitude).map_err(|_| Violation::new("integer out of range"))
    }
}
