use serde::{Deserialize, Serialize};

/// Numeric user identifier as carried in envelopes and tokens.
pub type UserId = i64;

/// User id of a connection that presented no valid credential.
pub const ANONYMOUS_USER_ID: UserId = 0;

/// Verified identity of a client connection.
///
/// Fixed for the lifetime of a connection. Anonymous connections are legal: several
/// read-only actions are available without a credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub user_uuid: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: UserId, user_uuid: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id,
            user_uuid: user_uuid.into(),
            username: username.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id > ANONYMOUS_USER_ID
    }
}
