//! Token type bytes.

use crate::errors::BananaError;

/// Type byte that terminates every token header.
///
/// The numbering is part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Legacy list marker. Rejected on receive, never sent.
    List = 0x80,
    /// Non-negative integer below the cutover; value is the header
    Int = 0x81,
    /// Byte string; header is the body length
    String = 0x82,
    /// Negative integer; header is the magnitude
    Neg = 0x83,
    /// IEEE754 double; 8 byte big-endian body
    Float = 0x84,
    /// Large non-negative integer; header is the body length
    LongInt = 0x85,
    /// Large negative integer; header is the body length
    LongNeg = 0x86,
    /// Vocabulary reference; header is the table index
    Vocab = 0x87,
    /// Start of a composite; header is its reference index
    Open = 0x88,
    /// End of a composite; header repeats the OPEN index
    Close = 0x89,
    /// Sender gave up on a composite; a CLOSE follows
    Abort = 0x8a,
}

impl TokenType {
    /// Parse a type byte.
    ///
    /// Only bytes with the high bit set reach this point, so anything
    /// outside the table is garbage on the wire.
    pub fn from_byte(byte: u8) -> Result<Self, BananaError> {
        Ok(match byte {
            0x80 => Self::List,
            0x81 => Self::Int,
            0x82 => Self::String,
            0x83 => Self::Neg,
            0x84 => Self::Float,
            0x85 => Self::LongInt,
            0x86 => Self::LongNeg,
            0x87 => Self::Vocab,
            0x88 => Self::Open,
            0x89 => Self::Close,
            0x8a => Self::Abort,
            other => return Err(BananaError::UnknownTokenType(other)),
        })
    }

    /// Wire value.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether a body of `header` bytes follows the type byte.
    pub fn has_sized_body(self) -> bool {
        matches!(self, Self::String | Self::LongInt | Self::LongNeg)
    }

    /// Short name for logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::List => "LIST",
            Self::Int => "INT",
            Self::String => "STRING",
            Self::Neg => "NEG",
            Self::Float => "FLOAT",
            Self::LongInt => "LONGINT",
            Self::LongNeg => "LONGNEG",
            Self::Vocab => "VOCAB",
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Abort => "ABORT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_byte_roundtrips() {
        for byte in 0x80..=0x8a_u8 {
            let token = TokenType::from_byte(byte).unwrap();
            assert_eq!(token.to_byte(), byte);
        }
    }

    #[test]
    fn unknown_type_byte_is_fatal() {
        assert_eq!(TokenType::from_byte(0x8b), Err(BananaError::UnknownTokenType(0x8b)));
        assert_eq!(TokenType::from_byte(0xff), Err(BananaError::UnknownTokenType(0xff)));
    }

    #[test]
    fn sized_bodies() {
        assert!(TokenType::String.has_sized_body());
        assert!(TokenType::LongNeg.has_sized_body());
        assert!(!TokenType::Float.has_sized_body());
        assert!(!TokenType::Open.has_sized_body());
    }
}
