use std::error::Error as StdError;
use std::fmt;

/// Errors while reading or minting an access token.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad signature, malformed token, expired, or missing required claims.
    InvalidToken,
    /// The token verified but names no user.
    AnonymousToken,
    /// The token could not be signed.
    Encoding,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_kind {
            ErrorKind::InvalidToken => write!(f, "Invalid access token"),
            ErrorKind::AnonymousToken => write!(f, "Access token does not name a user"),
            ErrorKind::Encoding => write!(f, "Failed to sign access token"),
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

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::InvalidToken,
        }
    }
}
