//! Typed parameters for endpoint inputs.

pub(crate) mod connect;
