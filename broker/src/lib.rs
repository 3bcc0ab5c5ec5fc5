//! Minimal request/reply/broadcast façade over a publish/subscribe transport.
//!
//! # Architecture
//!
//! - **Transport**: anything that can publish a string payload on a named channel and
//!   hand back a stream of messages for a set of channels ([`transport::Transport`]).
//!   [`transport::MemoryTransport`] is the in-process implementation.
//! - **Broker**: serializes envelopes onto the transport, runs one receive loop per
//!   subscription, and correlates replies with outstanding [`Broker::request`] calls
//!   through a table of pending requests keyed by envelope id.
//! - **Action registry**: maps an action name to an [`ActionHandler`]. A worker registers
//!   its handlers with [`Broker::on`] and subscribes to its `service:<name>` channel; every
//!   inbound request is dispatched to its handler as an independent task.
//!
//! # Channels
//!
//! - `service:<name>`: requests for one worker pool, see [`service_channel`]
//! - [`REPLY_CHANNEL`]: replies and errors travelling back to the gateway
//! - [`BROADCAST_CHANNEL`]: events for connected clients
//!
//! # Delivery guarantees
//!
//! A reply is delivered to a waiting `request` at most once: the pending entry is removed
//! in the same step that finds it, so duplicate or late replies are dropped. Nothing is
//! durable; a message published while nobody is subscribed is lost.

pub mod actions;
pub mod context;
pub mod error;
pub mod transport;

mod broker;
mod pending;

pub use actions::{ActionHandler, ActionRegistry};
pub use broker::{Broker, BrokerConfig, EnvelopeSink};
pub use context::{Context, Responder};
pub use error::{Error, ErrorKind};

/// Default channel carrying replies and errors back to the gateway.
pub const REPLY_CHANNEL: &str = "gateway:replies";
/// Default channel carrying events for connected clients.
pub const BROADCAST_CHANNEL: &str = "gateway:broadcast";
/// Prefix of the per-service request channels.
pub const SERVICE_CHANNEL_PREFIX: &str = "service:";

/// Channel on which requests for `service` are published.
pub fn service_channel(service: &str) -> String {
    format!("{SERVICE_CHANNEL_PREFIX}{service}")
}
