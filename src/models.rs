use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;

use crate::connection::UserId;

/// One inbound text frame: `{"commands": [...]}`. A missing `commands` key reads as empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub commands: Vec<RawCommand>,
}

/// Command as received; the tag is resolved and the payload validated at dispatch time.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCommand {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound broadcast envelope: `{"type": ..., "payload": ...}`.
///
/// The payload is kept as the exact JSON text it arrived as and written out unchanged.
/// A missing or `null` payload is sent as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Option<Box<RawValue>>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Encode a typed payload once, up front.
    pub fn encode<T: Serialize + ?Sized>(kind: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, Some(to_raw_value(payload)?)))
    }

    pub fn payload_json(&self) -> &str {
        self.payload.as_deref().map_or("null", RawValue::get)
    }
}

/// Payload of the `subscribed` announcement.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionNotice<'a> {
    #[serde(with = "crate::serde_u64_string")]
    pub user_id: UserId,
    pub markets: &'a [String],
}

/// Body of `POST /broadcast`. Empty `user_ids` means every connection.
///
/// A raw payload cannot be read through `#[serde(flatten)]`, so the envelope fields are listed here.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "crate::serde_u64_string::seq::deserialize")]
    pub user_ids: Vec<UserId>,
}

impl BroadcastRequest {
    pub fn into_parts(self) -> (Envelope, Vec<UserId>) {
        (Envelope::new(self.kind, self.payload), self.user_ids)
    }
}
