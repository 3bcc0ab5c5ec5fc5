use crate::error::{Error, ErrorKind};
use crate::identity::{Identity, UserId, ANONYMOUS_USER_ID};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Suffix appended to the request action on a successful reply.
pub const RESULT_SUFFIX: &str = ".result";
/// Suffix appended to the request action on an error reply.
pub const ERROR_SUFFIX: &str = ".error";

/// Error detail carried by an error envelope. `code` follows HTTP status semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// The unit of communication between clients, the hub and workers.
///
/// Missing fields deserialize to their defaults so a minimal client frame such as
/// `{"action":"ping"}` is accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Sender-generated token, the correlation key for replies.
    pub id: String,
    /// `<domain>.<verb>`, e.g. `social.post.like`.
    pub action: String,
    /// Logical worker pool, used to build the `service:<name>` channel.
    pub service: String,
    #[serde(skip_serializing_if = "is_anonymous")]
    pub user_id: UserId,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Id of the request this envelope answers.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Creation time of this envelope instance, unix milliseconds.
    #[serde(rename = "ts", alias = "timestamp")]
    pub timestamp: i64,
}

fn is_anonymous(user_id: &UserId) -> bool {
    *user_id == ANONYMOUS_USER_ID
}

impl Envelope {
    /// A bare envelope with a fresh id and the current timestamp.
    pub fn new(action: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: Self::generate_id(),
            action: action.into(),
            service: service.into(),
            timestamp: Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    pub fn request<T>(action: &str, service: &str, data: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let mut envelope = Self::new(action, service);
        envelope.data = Some(encode_data(data)?);
        Ok(envelope)
    }

    /// Builds the successful answer to `original`, copying its id into `reply_to`
    /// and its identity fields so the receiving side can route without re-deriving them.
    pub fn reply<T>(original: &Envelope, data: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let mut envelope = Self::answering(original, RESULT_SUFFIX);
        envelope.data = Some(encode_data(data)?);
        Ok(envelope)
    }

    /// An event with no specific recipient.
    pub fn event<T>(action: &str, service: &str, data: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        Self::request(action, service, data)
    }

    /// Builds the error answer to `original`. Never carries `data`.
    pub fn error(original: &Envelope, code: u16, message: impl Into<String>) -> Self {
        let mut envelope = Self::answering(original, ERROR_SUFFIX);
        envelope.error = Some(ErrorPayload {
            code,
            message: message.into(),
        });
        envelope
    }

    /// An error that answers no particular request, e.g. for a frame that could not
    /// be parsed and therefore has no id to correlate with.
    pub fn local_error(code: u16, message: impl Into<String>) -> Self {
        let mut envelope = Self::new("error", "");
        envelope.error = Some(ErrorPayload {
            code,
            message: message.into(),
        });
        envelope
    }

    fn answering(original: &Envelope, suffix: &str) -> Self {
        let mut envelope = Self::new(format!("{}{suffix}", original.action), &original.service);
        envelope.reply_to = original.id.clone();
        envelope.user_id = original.user_id;
        envelope.user_uuid = original.user_uuid.clone();
        envelope.username = original.username.clone();
        envelope
    }

    pub fn from_json(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).map_err(|e| Error::new(ErrorKind::Deserialize, e))
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(raw).map_err(|e| Error::new(ErrorKind::Deserialize, e))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::new(ErrorKind::Serialize, e))
    }

    /// Decodes `data` into the shape a handler expects.
    ///
    /// A missing payload is decoded as JSON `null`, so `Option<T>` and unit shapes
    /// accept an empty request.
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| Error::new(ErrorKind::InvalidPayload, e))
    }

    /// Overwrites the identity fields with a verified identity. Whatever the client
    /// put there is discarded.
    pub fn stamp(&mut self, identity: &Identity) {
        self.user_id = identity.user_id;
        self.user_uuid = identity.user_uuid.clone();
        self.username = identity.username.clone();
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.user_id, &self.user_uuid, &self.username)
    }

    /// Whether this envelope answers another one.
    ///
    /// The hub stamps forwarded requests with `reply_to == id`, so only an envelope
    /// pointing at a *different* id counts as a reply.
    pub fn is_reply(&self) -> bool {
        !self.reply_to.is_empty() && self.reply_to != self.id
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_user(&self) -> bool {
        self.user_id > ANONYMOUS_USER_ID
    }

    pub fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

fn encode_data<T: Serialize + ?Sized>(data: &T) -> Result<Value, Error> {
    serde_json::to_value(data).map_err(|e| Error::new(ErrorKind::Serialize, e))
}
