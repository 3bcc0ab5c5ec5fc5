//! Connect-time identity verification for the gateway.
//!
//! A client presents a bearer token when it opens its socket, either as the `token`
//! query parameter or in an `Authorization: Bearer <token>` header. The gateway turns
//! that into an [`Identity`] through an [`IdentityVerifier`]. A missing or invalid
//! token is not a rejection: the connection simply becomes anonymous.
//!
//! [`JwtVerifier`] checks HS256 tokens whose claims carry `user_id`, `uuid` and
//! `username`, with an optional `exp`.

use claims::AccessClaims;
use envelope::Identity;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::*;
use std::time::Duration;

pub use error::{Error, ErrorKind};

mod claims;
pub mod error;

/// Query parameter a browser client uses to pass its token on the upgrade request.
pub const TOKEN_QUERY_PARAM: &str = "token";

const BEARER_PREFIX: &str = "Bearer ";

/// Turns a bearer token into a verified identity.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, Error>;
}

/// HS256 verifier over a shared secret.
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present but not required.
        validation.required_spec_claims.clear();

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Signs a token for `identity`, expiring after `ttl` if one is given.
    pub fn issue(&self, identity: &Identity, ttl: Option<Duration>) -> Result<String, Error> {
        let exp = ttl.map(|ttl| jsonwebtoken::get_current_timestamp() + ttl.as_secs());
        let claims = AccessClaims::from_identity(identity, exp);

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|err| {
            Error {
                source: Some(Box::new(err)),
                error_kind: ErrorKind::Encoding,
            }
        })
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, Error> {
        let token_data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)?;
        let identity = Identity::from(token_data.claims);

        if !identity.is_authenticated() {
            return Err(Error {
                source: None,
                error_kind: ErrorKind::AnonymousToken,
            });
        }
        Ok(identity)
    }
}

/// Picks the token from the upgrade request: the query parameter wins over the
/// `Authorization` header. Empty values count as absent.
pub fn extract_token<'a>(query: Option<&'a str>, authorization: Option<&'a str>) -> Option<&'a str> {
    query.filter(|token| !token.is_empty()).or_else(|| {
        authorization
            .and_then(|header| header.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    })
}

/// Resolves the identity of a connecting client. Absence and invalidity of a token
/// both yield an anonymous identity.
pub fn identify(verifier: &dyn IdentityVerifier, token: Option<&str>) -> Identity {
    let Some(token) = token else {
        return Identity::anonymous();
    };

    match verifier.verify(token) {
        Ok(identity) => identity,
        Err(e) => {
            debug!("Connecting anonymously: {e}");
            Identity::anonymous()
        }
    }
}
