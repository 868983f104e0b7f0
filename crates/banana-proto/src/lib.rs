//! Wire vocabulary for the Banana serialization protocol.
//!
//! Every token on the wire is a base-128 header, one type byte, and for some
//! types a body. Headers are written least-significant digit first with each
//! digit in the low seven bits of a byte; the first byte with the high bit
//! set is the type byte and terminates the header.
//!
//! ```text
//! ┌──────────────────────────┬───────────┬──────────────────────┐
//! │ header digits (0x00-0x7f)│ type byte │ body (STRING, LONG*, │
//! │ little-endian, ≤ 64 B    │ 0x80-0x8a │ FLOAT only)          │
//! └──────────────────────────┴───────────┴──────────────────────┘
//! ```
//!
//! This crate owns the bytes-level pieces: the type byte table, the header
//! codec, the INT/LONGINT cutover, and the two error classes every layer
//! above speaks in. It does not know about object graphs.
//!
//! # Security
//!
//! A header longer than [`MAX_HEADER_LENGTH`] bytes is fatal: it is either
//! corruption or a peer trying to make us buffer without bound.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod header;
pub mod number;
pub mod token;
pub mod writer;

pub use errors::{BananaError, Result, UnbananaFailure, Violation};
pub use header::{MAX_HEADER_LENGTH, decode_header, encode_header, find_type_byte};
pub use number::{INT_CUTOVER, IntToken, MAX_LONG_BODY};
pub use token::TokenType;
pub use writer::TokenWriter;
