use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A message delivered to pub/sub topic listeners.
///
/// `data` is the decoded JSON payload exactly as published; objects,
/// arrays, primitives and null are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubMessage {
    /// Server-assigned message identifier.
    pub id: String,

    /// Topic the message was published to.
    pub topic: String,

    /// Server-side creation timestamp (RFC 3339 string).
    #[serde(default)]
    pub created: String,

    /// Decoded payload.
    #[serde(default)]
    pub data: JsonValue,
}
