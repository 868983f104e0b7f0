//! Deterministic test harness for Perspective Broker connections.
//!
//! - [`BrokerPair`] wires two brokers back to back in memory and shuttles
//!   bytes between them, optionally cut into fixed or seeded random chunks.
//! - [`wire`] decodes captured bytes into broker messages for assertions
//!   about what actually crossed the connection.
//! - [`Session`] drives a broker over any async byte stream; with turmoil's
//!   simulated TCP it gives real read boundaries and latency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod net;
pub mod pair;
pub mod wire;

pub use net::Session;
pub use pair::{BrokerPair, Chunking};
pub use wire::{WireMessage, decode_messages};

/// Install a `RUST_LOG`-filtered subscriber that writes through the test
/// harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
