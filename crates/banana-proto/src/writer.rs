//! Token emission into an outbound buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{header::encode_header, number::IntToken, token::TokenType};

/// Appends encoded tokens to a growable buffer.
///
/// The buffer is drained by whoever owns the transport; tokens are never
/// reordered once written.
#[derive(Debug, Default)]
pub struct TokenWriter {
    buffer: BytesMut,
}

impl TokenWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    fn header(&mut self, value: u64, token: TokenType) {
        encode_header(value, &mut self.buffer);
        self.buffer.put_u8(token.to_byte());
    }

    /// Write an integer, choosing INT/NEG or LONGINT/LONGNEG.
    pub fn int(&mut self, value: i128) {
        match IntToken::for_value(value) {
            IntToken::Short { token, magnitude } => self.header(magnitude, token),
            IntToken::Long { token, body } => {
                self.header(body.len() as u64, token);
                self.buffer.put_slice(&body);
            },
        }
    }

    /// Write a FLOAT token: empty header, 8 byte big-endian body.
    pub fn float(&mut self, value: f64) {
        self.buffer.put_u8(TokenType::Float.to_byte());
        self.buffer.put_f64(value);
    }

    /// Write a STRING token.
    pub fn string(&mut self, body: &[u8]) {
        self.header(body.len() as u64, TokenType::String);
        self.buffer.put_slice(body);
    }

    /// Write a VOCAB token naming a table entry.
    pub fn vocab(&mut self, index: u64) {
        self.header(index, TokenType::Vocab);
    }

    /// Write an OPEN token.
    pub fn open(&mut self, index: u64) {
        self.header(index, TokenType::Open);
    }

    /// Write a CLOSE token.
    pub fn close(&mut self, index: u64) {
        self.header(index, TokenType::Close);
    }

    /// Write an ABORT token.
    pub fn abort(&mut self, index: u64) {
        self.header(index, TokenType::Abort);
    }

    /// Bytes written and not yet taken.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is waiting to be taken.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take everything written so far.
    pub fn take(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() { None } else { Some(self.buffer.split().freeze()) }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn written(f: impl FnOnce(&mut TokenWriter)) -> Vec<u8> {
        let mut writer = TokenWriter::new();
        f(&mut writer);
        writer.take().map(|b| b.to_vec()).unwrap_or_default()
    }

    #[test]
    fn small_ints() {
        assert_eq!(written(|w| w.int(0)), hex!("00 81"));
        assert_eq!(written(|w| w.int(5)), hex!("05 81"));
        assert_eq!(written(|w| w.int(-5)), hex!("05 83"));
        assert_eq!(written(|w| w.int(200)), hex!("48 01 81"));
    }

    #[test]
    fn long_ints() {
        assert_eq!(written(|w| w.int(1 << 31)), hex!("04 85 80 00 00 00"));
        assert_eq!(written(|w| w.int(-(1 << 31) - 1)), hex!("04 86 80 00 00 01"));
    }

    #[test]
    fn strings_and_structure() {
        assert_eq!(written(|w| w.string(b"hi")), hex!("02 82 68 69"));
        assert_eq!(written(|w| w.open(0)), hex!("00 88"));
        assert_eq!(written(|w| w.close(3)), hex!("03 89"));
        assert_eq!(written(|w| w.abort(1)), hex!("01 8a"));
        assert_eq!(written(|w| w.vocab(2)), hex!("02 87"));
    }

    #[test]
    fn float_has_no_header() {
        assert_eq!(written(|w| w.float(1.5)), hex!("84 3f f8 00 00 00 00 00 00"));
    }

    #[test]
    fn take_drains() {
        let mut writer = TokenWriter::new();
        writer.int(1);
        assert_eq!(writer.len(), 2);
        assert!(writer.take().is_some());
        assert!(writer.is_empty());
        assert!(writer.take().is_none());
    }
}
