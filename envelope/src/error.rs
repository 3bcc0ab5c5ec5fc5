//! Error types for the `envelope` crate.
//!
//! Follows the same pattern as the other crates in the workspace: a root `Error`
//! struct holding an `ErrorKind` and an optional source for error chaining.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Categories of envelope errors.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// An outgoing envelope or its `data` could not be encoded.
    Serialize,
    /// An incoming frame is not a well-formed envelope.
    Deserialize,
    /// The envelope is well-formed but its `data` does not match the shape a
    /// handler asked for. Handlers answer this with a 400-class error.
    InvalidPayload,
}

impl Error {
    pub(crate) fn new(error_kind: ErrorKind, source: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(source)),
            error_kind,
        }
    }

    /// Whether this error was caused by the client rather than the gateway.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::Deserialize | ErrorKind::InvalidPayload
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let detail = self
            .source
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        match self.error_kind {
            ErrorKind::Serialize => write!(f, "failed to encode envelope: {detail}"),
            ErrorKind::Deserialize => write!(f, "malformed envelope: {detail}"),
            ErrorKind::InvalidPayload => write!(f, "invalid payload: {detail}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}
