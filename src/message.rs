//! The wire message: an unordered mapping opaque to the exchange layer
//! beyond a handful of reserved fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single outbound or inbound message.
///
/// `type` is mandatory; everything else is plugin-defined payload. The
/// exchange layer injects `api` (a monotonic per-host counter) and passes
/// `operation-id` through untouched when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Message {
    /// Builds a message of the given type with no other fields.
    #[must_use]
    pub fn new(message_type: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String(message_type.into()));
        Self { fields }
    }

    /// Builds a message from an already-assembled field map; fails if `type` is missing.
    pub fn from_fields(fields: Map<String, Value>) -> Option<Self> {
        if fields.contains_key("type") {
            Some(Self { fields })
        } else {
            None
        }
    }

    /// The mandatory `type` field.
    #[must_use]
    pub fn message_type(&self) -> &str {
        self.fields
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// The correlation id a server-issued request expects an `operation-result` reply for.
    #[must_use]
    pub fn operation_id(&self) -> Option<i64> {
        self.fields.get("operation-id").and_then(Value::as_i64)
    }

    /// Reads an arbitrary field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Sets an arbitrary field, builder-style.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Sets the `api` counter field the exchange layer stamps on outbound messages.
    pub fn set_api(&mut self, api: u64) {
        self.fields.insert("api".to_string(), Value::from(api));
    }

    /// Sets the `timestamp` (RFC 3339) field the exchange layer stamps on
    /// outbound messages at packaging time.
    pub fn set_timestamp(&mut self, timestamp: impl Into<Value>) {
        self.fields.insert("timestamp".to_string(), timestamp.into());
    }
}

/// Builds the `operation-result { status: FAILED, ... }` message enqueued when
/// no handler acknowledges an inbound request carrying an `operation-id`.
#[must_use]
pub fn unhandled_operation_result(message_type: &str, operation_id: i64) -> Message {
    Message::new("operation-result")
        .with_field("operation-id", operation_id)
        .with_field("status", "FAILED")
        .with_field(
            "result-text",
            format!("Landscape client failed to handle this request ({message_type})"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_carries_its_type() {
        let msg = Message::new("test");
        assert_eq!(msg.message_type(), "test");
        assert_eq!(msg.operation_id(), None);
    }

    #[test]
    fn with_field_roundtrips_through_json() {
        let msg = Message::new("test").with_field("operation-id", 4);
        assert_eq!(msg.operation_id(), Some(4));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "test");
        assert_eq!(json["operation-id"], 4);
    }

    #[test]
    fn from_fields_rejects_missing_type() {
        let mut fields = Map::new();
        fields.insert("foo".into(), Value::from("bar"));
        assert!(Message::from_fields(fields).is_none());
    }

    #[test]
    fn unhandled_operation_result_shape() {
        let result = unhandled_operation_result("foobar", 4);
        assert_eq!(result.message_type(), "operation-result");
        assert_eq!(result.get("status").unwrap(), "FAILED");
        assert_eq!(
            result.get("result-text").unwrap().as_str().unwrap(),
            "Landscape client failed to handle this request (foobar)"
        );
    }
}
