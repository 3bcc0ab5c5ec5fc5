//! Wire protocol shared by browser clients, the gateway hub and backend workers.
//!
//! Every frame on a client socket and every message on the pub/sub transport is a
//! single JSON-encoded [`Envelope`]. An envelope is one of four shapes:
//!
//! - **request**: `action` set, `reply_to` empty (or stamped equal to `id` by the hub)
//! - **reply**: `reply_to` names the original `id`, `action` suffixed `.result`
//! - **error**: `reply_to` names the original `id`, `error` populated, `action` suffixed `.error`
//! - **event**: `reply_to` empty, routed by identity fields or broadcast to everyone
//!
//! Identity fields (`user_id`, `user_uuid`, `username`) are only ever trusted when
//! written by the hub from a verified credential; see [`Envelope::stamp`].
//!
//! # Example
//!
//! ```rust
//! use envelope::Envelope;
//! use serde_json::json;
//!
//! let request = Envelope::request("social.feed", "social", &json!({"limit": 5})).unwrap();
//! let reply = Envelope::reply(&request, &json!([])).unwrap();
//!
//! assert_eq!(reply.reply_to, request.id);
//! assert_eq!(reply.action, "social.feed.result");
//! ```

pub mod error;
pub mod identity;

mod message;

pub use message::{Envelope, ErrorPayload, ERROR_SUFFIX, RESULT_SUFFIX};
pub use error::{Error, ErrorKind};
pub use identity::{Identity, UserId, ANONYMOUS_USER_ID};
