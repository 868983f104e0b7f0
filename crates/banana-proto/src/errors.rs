//! Error taxonomy for the Banana protocol.
//!
//! Two classes, kept apart on purpose:
//!
//! - [`BananaError`]: the byte stream itself is broken. The connection cannot
//!   be resynchronized and must be dropped.
//! - [`Violation`]: a well-formed token arrived that the receiver's schema
//!   does not accept. The offending subtree is discarded and decoding
//!   continues with the next object.

use std::fmt;

use thiserror::Error;

/// Result alias for fatal protocol errors.
pub type Result<T> = std::result::Result<T, BananaError>;

/// Fatal protocol error. The connection must be closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BananaError {
    /// More than 64 header digits without a type byte
    #[error("token header exceeds {limit} bytes")]
    HeaderTooLong {
        /// Maximum header length
        limit: usize,
    },

    /// Header digits encode a value that does not fit in 64 bits
    #[error("token header value overflows 64 bits")]
    HeaderOverflow,

    /// Type byte is not part of the vocabulary
    #[error("unknown token type byte {0:#04x}")]
    UnknownTokenType(u8),

    /// The legacy LIST token is never accepted
    #[error("legacy LIST token is not supported")]
    LegacyList,

    /// OPEN arrived while the previous OPEN was still collecting index tokens
    #[error("OPEN received while collecting index tokens")]
    OpenDuringIndex,

    /// Index phase received something other than a string or vocab token
    #[error("index token must be a string, got {0}")]
    BadIndexToken(&'static str),

    /// Index token longer than the configured maximum
    #[error("index token of {length} bytes exceeds limit {limit}")]
    IndexTooLong {
        /// Declared length
        length: u64,
        /// Configured limit
        limit: usize,
    },

    /// Index token referenced a vocabulary entry that does not exist
    #[error("index token uses unknown vocabulary entry {0}")]
    UnknownIndexVocab(u64),

    /// CLOSE or ABORT with no object open
    #[error("{token} received with no open object")]
    NothingOpen {
        /// CLOSE or ABORT
        token: &'static str,
    },

    /// CLOSE or ABORT header does not match the innermost OPEN
    #[error("{token} index {got} does not match open object {expected}")]
    IndexMismatch {
        /// CLOSE or ABORT
        token: &'static str,
        /// Index of the innermost open object
        expected: u64,
        /// Index carried by the token
        got: u64,
    },

    /// OPEN header beyond the configured reference limit
    #[error("OPEN index {index} exceeds limit {limit}")]
    OpenIndexTooLarge {
        /// Declared index
        index: u64,
        /// Configured limit
        limit: u64,
    },
}

/// Recoverable schema-level error.
///
/// Carries a human readable message and the location (opentype path) where
/// it was raised. The location is filled in by the codec as the violation
/// crosses unslicer frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    message: String,
    location: Option<String>,
}

impl Violation {
    /// Create a violation with no location.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), location: None }
    }

    /// The violation message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the violation was raised, if known.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Attach a location unless one is already set.
    ///
    /// The innermost frame wins: a violation re-raised by a parent keeps the
    /// path of the frame that first rejected the token.
    #[must_use]
    pub fn at(mut self, location: impl Into<String>) -> Self {
        if self.location.is_none() {
            self.location = Some(location.into());
        }
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} (at {location})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A violation delivered up the unslicer stack in place of a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unbanana failure: {violation}")]
pub struct UnbananaFailure {
    /// The violation that abandoned the subtree
    pub violation: Violation,
}

impl UnbananaFailure {
    /// Wrap a violation.
    pub fn new(violation: Violation) -> Self {
        Self { violation }
    }
}

impl From<Violation> for UnbananaFailure {
    fn from(violation: Violation) -> Self {
        Self::new(violation)
    }
}
