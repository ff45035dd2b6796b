//! Broker contracts and drivers.
//!
//! The runtime sees the broker as an inbound stream of UTF-8 JSON strings
//! and an outbound sink of the same, plus a dead-letter sink for payloads
//! that cannot be processed. The in-memory driver wires the outbound sink
//! back into the inbound channel, which is exactly the self-stepping loop a
//! single-process deployment needs.

use async_trait::async_trait;
use snafu::prelude::*;

pub mod mem;

pub use mem::InMemoryBroker;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to publish message: {message}"))]
    Publish { message: String },

    #[snafu(display("Messaging type '{kind}' has no driver compiled in"))]
    Unsupported { kind: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outbound sink of UTF-8 JSON strings on one logical channel.
#[async_trait]
pub trait MessageEmitter: Send + Sync + std::fmt::Debug {
    async fn emit(&self, message: &str) -> Result<()>;
}

/// Inbound stream of UTF-8 JSON strings on one logical channel. `recv`
/// resolves to `None` once the channel is closed and drained.
#[async_trait]
pub trait MessageSource: Send + Sync + std::fmt::Debug {
    async fn recv(&self) -> Option<String>;
}

/// What the consumer decided about one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    DeadLetter,
}
