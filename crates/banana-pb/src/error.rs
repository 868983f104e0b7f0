//! Errors seen by callers of [`crate::Broker::call_remote`].

use banana_core::Violation;
use thiserror::Error;

use crate::failure::Failure;

/// Why a remote call did not produce a value.
///
/// `UnknownMethod`, `Violation` and `ForeignReference` returned directly by
/// `call_remote` were detected locally; nothing was written to the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The target's interface declares no such method
    #[error("interface {interface} has no method {method:?}")]
    UnknownMethod {
        /// Interface consulted
        interface: String,
        /// Method requested
        method: String,
    },

    /// Arguments or result rejected by a schema, or not serializable
    #[error("violation: {0}")]
    Violation(#[from] Violation),

    /// The peer reported a failure
    #[error("remote failure: {0}")]
    Remote(Failure),

    /// The connection closed before an answer arrived
    #[error("connection lost")]
    ConnectionLost,

    /// The caller cancelled the call
    #[error("call cancelled")]
    Cancelled,

    /// The reference was received on a different connection
    #[error("reference belongs to another broker")]
    ForeignReference,
}
