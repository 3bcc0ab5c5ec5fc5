//! Typed bodies returned by the HTTP endpoints.

pub(crate) mod hub_status;
