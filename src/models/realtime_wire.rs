use serde::{Deserialize, Serialize};

/// Body of the SSE connect event: the server-assigned session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMessage {
    pub client_id: String,
}

/// Body of the topic-submission POST to the realtime endpoint.
///
/// Always carries the complete live topic set; the server replaces its
/// view of this client's subscriptions with the submitted list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSubmission {
    pub client_id: String,
    pub subscriptions: Vec<String>,
}
