use serde::{Deserialize, Serialize};

/// Acknowledgement returned by [`PubSubChannel::publish`](crate::PubSubChannel::publish).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAck {
    /// Server-assigned message identifier.
    pub id: String,

    /// Topic the message was published to.
    pub topic: String,

    /// Server-side creation timestamp (RFC 3339 string).
    #[serde(default)]
    pub created: String,
}
