use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Failures while starting or running the HTTP server.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An entry of `allowed_origins` is not a valid header value.
    InvalidOrigin(String),
    /// The listen address could not be bound.
    Bind(String),
    /// The server stopped with an I/O error.
    Serve,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::InvalidOrigin(origin) => write!(f, "Invalid CORS origin {origin:?}"),
            ErrorKind::Bind(address) => write!(f, "Failed to bind {address}"),
            ErrorKind::Serve => write!(f, "HTTP server failed"),
        }?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub(crate) fn error<E>(error_kind: ErrorKind, source: E) -> Error
where
    E: StdError + Send + Sync + 'static,
{
    Error {
        source: Some(Box::new(source)),
        error_kind,
    }
}
