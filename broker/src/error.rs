//! Error types for the `broker` crate.
//!
//! Follows the same pattern as `envelope::error` with a root Error struct and error kind enums.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for the broker.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of broker errors.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// An envelope could not be encoded before publishing.
    Envelope,
    Transport(TransportErrorKind),
    Request(RequestErrorKind),
}

/// Failures of the underlying pub/sub transport.
#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    Closed,
    Send,
    Subscribe,
}

/// Ways a correlated request can end without a reply.
#[derive(Debug, PartialEq)]
pub enum RequestErrorKind {
    Timeout,
    Shutdown,
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        self.error_kind == ErrorKind::Request(RequestErrorKind::Timeout)
    }

    pub fn is_shutdown(&self) -> bool {
        self.error_kind == ErrorKind::Request(RequestErrorKind::Shutdown)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let detail = self
            .source
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        match &self.error_kind {
            ErrorKind::Envelope => write!(f, "Envelope error: {detail}"),
            ErrorKind::Transport(kind) => write!(f, "Transport error ({kind:?}): {detail}"),
            ErrorKind::Request(kind) => write!(f, "Request error ({kind:?}): {detail}"),
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

impl From<envelope::Error> for Error {
    fn from(err: envelope::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Envelope,
        }
    }
}

/// Helper function to create transport errors.
pub fn transport_error(kind: TransportErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport(kind),
    }
}

/// Helper function to create request errors.
pub fn request_error(kind: RequestErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Request(kind),
    }
}
