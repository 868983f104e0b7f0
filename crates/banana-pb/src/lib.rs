//! Perspective Broker
//!
//! Remote method calls over a Banana connection. Each connection gets one
//! [`Broker`]; it multiplexes outbound calls, inbound calls and their
//! answers, and keeps the reference tables that let objects be passed by
//! reference in either direction.
//!
//! # Messages
//!
//! Four top-level opentypes travel between brokers: `call`, `answer`,
//! `error` and `decref`. Objects cross the wire as `my-reference` (one of
//! the sender's objects, counted) or `your-reference` (one of the
//! receiver's own objects, handed back).
//!
//! # Lifetimes
//!
//! The owner of an object counts every `my-reference` it writes. The peer
//! keeps one [`RemoteReference`] per clid and, once the last clone is
//! dropped, sends one `decref` for each `my-reference` it decoded. The
//! owner drops the object when its count reaches zero; a later `call`
//! naming that clid is refused as an unknown target.
//!
//! # Validation
//!
//! A proxy whose interface is known validates method names and arguments
//! before anything is written; the serving side constrains each argument
//! token against the same interface as it arrives.

pub mod broker;
pub mod error;
pub mod failure;
mod messages;
pub mod reference;
pub mod referenceable;
pub mod schema;

mod state;

pub use broker::{Broker, BrokerAction, BrokerConfig, ROOT_NAME, RemoteCall};
pub use error::CallError;
pub use failure::Failure;
pub use messages::reference_constraint;
pub use reference::{RefId, RemoteObject, RemoteReference};
pub use referenceable::{LocalObject, MethodTable, Referenceable, export};
pub use schema::{Arguments, CallArgs, InterfaceRegistry, InterfaceSchema, MethodSchema};
