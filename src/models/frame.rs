use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Control frames sent from client to server over the pub/sub WebSocket.
///
/// Every frame carries a locally generated `requestId` used to correlate
/// the matching acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Publish a payload to a topic.
    Publish {
        topic: String,
        data: JsonValue,
        request_id: String,
    },

    /// Register interest in a topic.
    Subscribe { topic: String, request_id: String },

    /// Drop interest in one topic, or in all topics when `topic` is absent.
    Unsubscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        request_id: String,
    },

    /// Liveness probe; answered by a `pong` frame.
    Ping { request_id: String },
}

impl ClientFrame {
    /// The correlation id this frame carries.
    pub fn request_id(&self) -> &str {
        match self {
            ClientFrame::Publish { request_id, .. }
            | ClientFrame::Subscribe { request_id, .. }
            | ClientFrame::Unsubscribe { request_id, .. }
            | ClientFrame::Ping { request_id } => request_id,
        }
    }
}

/// Frames received from the server over the pub/sub WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// First frame after the transport opens; carries the session id.
    Ready { client_id: String },

    /// A message delivered for a subscribed topic.
    Message {
        id: String,
        topic: String,
        #[serde(default)]
        created: String,
        #[serde(default)]
        data: JsonValue,
    },

    /// Acknowledgement of a `publish` request.
    Published {
        request_id: String,
        #[serde(default)]
        id: String,
        #[serde(default)]
        topic: String,
        #[serde(default)]
        created: String,
    },

    /// Acknowledgement of a `subscribe` request.
    Subscribed { request_id: String },

    /// Acknowledgement of an `unsubscribe` request.
    Unsubscribed { request_id: String },

    /// Acknowledgement of a `ping` request.
    Pong { request_id: String },

    /// Server-reported failure; correlated when `requestId` is present,
    /// connection-level otherwise.
    Error {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        message: String,
    },
}

impl ServerFrame {
    /// The correlation id carried by acknowledgement frames, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerFrame::Published { request_id, .. }
            | ServerFrame::Subscribed { request_id }
            | ServerFrame::Unsubscribed { request_id }
            | ServerFrame::Pong { request_id } => Some(request_id),
            ServerFrame::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}
