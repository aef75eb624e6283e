use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Per-subscription overrides for a realtime topic.
///
/// Two subscriptions to the same base topic with different options are
/// tracked as distinct server-side topics: the options are folded into a
/// composite topic key (`topic?options={...}`). Sorted maps keep the key
/// canonical, so equal options always produce equal keys.
///
/// # Example
///
/// ```rust
/// use lumen_link::SubscribeOptions;
///
/// let options = SubscribeOptions::new()
///     .with_query("filter", "status='open'")
///     .with_header("X-Trace", "abc123");
///
/// assert_eq!(
///     options.composite_key("orders/*"),
///     r#"orders/*?options={"headers":{"X-Trace":"abc123"},"query":{"filter":"status='open'"}}"#
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Extra query parameters applied server-side to this subscription.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, JsonValue>,

    /// Extra headers applied server-side to this subscription.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl SubscribeOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Whether any override is set.
    pub fn is_empty(&self) -> bool {
        self.query.is_empty() && self.headers.is_empty()
    }

    /// The composite topic key these options produce for `topic`.
    ///
    /// Empty options leave the topic untouched.
    pub fn composite_key(&self, topic: &str) -> String {
        if self.is_empty() {
            return topic.to_string();
        }
        // BTreeMap serialization is order-stable; serializing a struct with
        // only non-empty fields would still be option-order dependent, so
        // build the object explicitly with sorted member names.
        let mut object = serde_json::Map::new();
        if !self.headers.is_empty() {
            object.insert(
                "headers".to_string(),
                serde_json::to_value(&self.headers).unwrap_or(JsonValue::Null),
            );
        }
        if !self.query.is_empty() {
            object.insert(
                "query".to_string(),
                serde_json::to_value(&self.query).unwrap_or(JsonValue::Null),
            );
        }
        format!("{}?options={}", topic, JsonValue::Object(object))
    }

    /// The base topic of a composite key (the part before `?options=`).
    pub fn base_topic(key: &str) -> &str {
        key.split_once("?options=").map(|(base, _)| base).unwrap_or(key)
    }
}
