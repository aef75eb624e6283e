use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Kind of record change carried by a realtime event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Create,
    Update,
    Delete,
    /// Forward-compatibility: an action this client version does not know.
    Unknown,
}

impl RecordAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordAction::Create => "create",
            RecordAction::Update => "update",
            RecordAction::Delete => "delete",
            RecordAction::Unknown => "unknown",
        }
    }
}

impl Serialize for RecordAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "create" => RecordAction::Create,
            "update" => RecordAction::Update,
            "delete" => RecordAction::Delete,
            _ => RecordAction::Unknown,
        })
    }
}

/// Decoded payload of a realtime record-change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    /// What happened to the record.
    pub action: RecordAction,

    /// The affected record as raw JSON.
    #[serde(default)]
    pub record: JsonValue,
}
