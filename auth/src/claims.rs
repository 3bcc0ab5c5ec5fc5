//! Claims carried by a gateway access token.

use envelope::{Identity, UserId};
use serde::{Deserialize, Serialize};

/// The subset of access-token claims the gateway reads.
///
/// Only `user_id` is required. `exp` is validated when present, so tokens minted
/// without an expiry are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AccessClaims {
    pub(crate) user_id: UserId,
    #[serde(default)]
    pub(crate) uuid: String,
    #[serde(default)]
    pub(crate) username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) exp: Option<u64>,
}

impl AccessClaims {
    pub(crate) fn from_identity(identity: &Identity, exp: Option<u64>) -> Self {
        Self {
            user_id: identity.user_id,
            uuid: identity.user_uuid.clone(),
            username: identity.username.clone(),
            exp,
        }
    }
}

impl From<AccessClaims> for Identity {
    fn from(claims: AccessClaims) -> Self {
        Identity::new(claims.user_id, claims.uuid, claims.username)
    }
}
