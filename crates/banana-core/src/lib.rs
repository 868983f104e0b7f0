//! Banana codec core
//!
//! Pure serialization state machines for the Banana protocol, decoupled from
//! I/O. The caller feeds inbound bytes in and takes outbound bytes out; the
//! codec never touches a socket, a clock, or a runtime.
//!
//! # Architecture
//!
//! Outbound values are decomposed by [`Slicer`]s into child values and
//! tokens. Inbound tokens drive a stack of [`Unslicer`]s that rebuild the
//! values, each consulting its [`Constraint`] before a token is consumed so
//! hostile input is refused from its header alone.
//!
//! Protocols layered on the codec plug in through a [`Host`] (outbound
//! objects the codec cannot slice itself) and a [`Registry`] (inbound
//! opentypes). The broker in `banana-pb` is one such protocol.
//!
//! # Components
//!
//! - [`value`]: the value model and shared composites
//! - [`constraint`]: schemas checked against tokens and values
//! - [`slicer`]: outbound strategies and the [`Host`] seam
//! - [`unslicer`]: inbound state machines and their [`Context`]
//! - [`registry`]: opentype name to unslicer factory
//! - [`config`]: limits and reference-scope policy
//! - [`banana`]: the [`Banana`] codec itself

pub mod banana;
pub mod config;
pub mod constraint;
pub mod registry;
pub mod slicer;
pub mod unslicer;
pub mod value;

mod receive;
mod send;

pub use banana::{Banana, BananaEvent, SendId};
pub use banana_proto::{BananaError, TokenType, UnbananaFailure, Violation};
pub use config::{BananaConfig, ReferenceScope};
pub use constraint::Constraint;
pub use registry::{Factory, Registry};
pub use slicer::{FixedSlicer, Host, Slicer};
pub use unslicer::{Context, Unslicer};
pub use value::{Deferred, Dict, Key, List, Object, ObjectRef, Tuple, Value};
