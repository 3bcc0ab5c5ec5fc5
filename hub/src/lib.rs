//! Connection hub: the single authority over who is connected and which socket
//! receives an outbound envelope.
//!
//! # Architecture
//!
//! - **Dual-index registry**: live connections by id, plus an index from authenticated
//!   user id to that user's connections (multi-device). See [`connection`].
//! - **One read loop per connection**: [`Hub::serve`] parses frames, answers `ping`,
//!   stamps verified identity onto every request and routes it to a local handler or
//!   to the `service:<name>` channel of an attached [`broker::Broker`].
//! - **One writer task per connection**: every outbound frame goes through a bounded
//!   queue. A full or closed queue is a failed write and disconnects that connection
//!   only.
//! - **Request routes**: the hub remembers which connection issued each forwarded
//!   request, so the reply reaches exactly that socket.
//!
//! # Delivery
//!
//! | envelope                          | recipients |
//! |-----------------------------------|------------|
//! | reply with a known route          | the originating connection, once |
//! | reply without a route, `user_id`  | all connections of that user ([`ReplyFallback::User`]) or nobody |
//! | reply without a route or user     | nobody |
//! | event with `user_id`              | all connections of that user |
//! | event without `user_id`           | every connection |
//!
//! # Errors sent to clients
//!
//! - `400`: the frame is not a valid envelope; the connection stays open
//! - `404`: no local handler for the action and no service to forward to
//! - `409`: the request id is already in flight on another connection
//! - `502`: forwarding to the service channel failed

pub mod connection;

mod hub;
mod routes;

pub use connection::{Connection, ConnectionId, ConnectionRegistry};
pub use hub::{
    Hub, HubConfig, HubStatus, ReplyFallback, PING_ACTION, PONG_ACTION, PRESENCE_ACTION,
    SYSTEM_SERVICE,
};
