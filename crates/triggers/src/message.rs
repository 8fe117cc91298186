//! Broker messages and the JSON envelope POSTed to callbacks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// System and user properties of a brokered message.
///
/// Field names serialise in PascalCase, matching the property names Service
/// Bus uses, because the struct is flattened straight into [`CallbackPayload`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageProperties {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub delivery_count: u32,
    #[serde(default)]
    pub sequence_number: Option<i64>,
    #[serde(default)]
    pub enqueued_time_utc: Option<String>,
    #[serde(default)]
    pub locked_until_utc: Option<String>,
    #[serde(default)]
    pub time_to_live: Option<f64>,
    /// Application-defined properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A message as read from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokeredMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl BrokeredMessage {
    /// Creates a message with the given id and body and default properties.
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: MessageProperties {
                message_id: Some(message_id.into()),
                ..MessageProperties::default()
            },
            body: body.into(),
        }
    }

    /// Message id for logging, or `"<none>"`.
    pub fn id_for_log(&self) -> &str {
        self.properties.message_id.as_deref().unwrap_or("<none>")
    }
}

/// Opaque settlement handle for a locked message.
///
/// For the REST transport this is the lock URI; for the in-memory broker it is
/// a generated token. Only the receiver that produced it interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A message received in peek-lock mode, awaiting `complete` or `abandon`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub lock_token: LockToken,
    pub message: BrokeredMessage,
}

/// JSON body POSTed to a trigger's callback URL.
///
/// The message properties sit at the top level; the body is decoded as UTF-8
/// (lossily) into `ContentData`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackPayload {
    #[serde(flatten)]
    pub properties: MessageProperties,
    pub lock_token: String,
    pub content_data: String,
}

impl CallbackPayload {
    /// Builds the callback envelope for a received message.
    pub fn from_received(received: &ReceivedMessage) -> Self {
        Self {
            properties: received.message.properties.clone(),
            lock_token: received.lock_token.as_str().to_owned(),
            content_data: String::from_utf8_lossy(&received.message.body).into_owned(),
        }
    }
}
