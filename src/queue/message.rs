//! Message representation and stream wire format.
//!
//! Each stream entry stores the user body as one JSON text field plus a
//! small fixed metadata header. Dead-letter annotations (`_error`,
//! `_source_queue`, `_moved_at`) live inside the body object so they travel
//! with the payload and can be stripped on requeue.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{MqError, Result};

/// Wire field holding the serialized body.
pub(crate) const FIELD_BODY: &str = "body";
/// Wire field holding the producer timestamp, ms since epoch.
pub(crate) const FIELD_CREATED_AT: &str = "created_at";
/// Wire field holding the absolute expiry deadline, ms since epoch.
pub(crate) const FIELD_EXPIRES_AT: &str = "expires_at";
/// Wire field holding the persisted delivery counter.
pub(crate) const FIELD_DELIVERY_COUNT: &str = "delivery_count";

/// Body key carrying the dead-letter reason.
pub(crate) const KEY_ERROR: &str = "_error";
/// Body key naming the queue a dead-lettered message came from.
pub(crate) const KEY_SOURCE_QUEUE: &str = "_source_queue";
/// Body key holding the relocation timestamp, ms since epoch.
pub(crate) const KEY_MOVED_AT: &str = "_moved_at";

/// A message claimed from a queue.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Backend-assigned id of the form `{ms-timestamp}-{sequence}`;
    /// lexicographically sortable by time within a queue.
    pub id: String,

    /// The user payload, opaque to the queue runtime.
    pub body: Value,

    /// Producer-observed wall clock at publish.
    pub created_at: DateTime<Utc>,

    /// Absolute expiry deadline; `None` means the message never expires.
    pub expires_at: Option<DateTime<Utc>>,

    /// Times this message has been handed to a consumer, including the
    /// delivery that produced this value.
    pub delivery_count: u32,
}

impl Message {
    /// Whether the expiry deadline has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|deadline| deadline <= now).unwrap_or(false)
    }

    /// The dead-letter reason, when this message was read from a DLQ.
    pub fn error(&self) -> Option<&str> {
        self.body.get(KEY_ERROR).and_then(Value::as_str)
    }

    /// The queue a dead-lettered message was moved from.
    pub fn source_queue(&self) -> Option<&str> {
        self.body.get(KEY_SOURCE_QUEUE).and_then(Value::as_str)
    }

    /// Decode a stream entry into a message.
    ///
    /// `delivery_bump` is added to the persisted counter; claims pass 1 to
    /// account for the in-flight delivery, plain reads pass 0.
    pub(crate) fn from_entry(
        id: String,
        map: &HashMap<String, redis::Value>,
        delivery_bump: u32,
    ) -> Result<Self> {
        let body_text = field_string(map, FIELD_BODY)
            .ok_or_else(|| MqError::Message(format!("entry {id} has no body field")))?;
        let body: Value = serde_json::from_str(&body_text)?;

        let created_ms = field_string(map, FIELD_CREATED_AT)
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| MqError::Message(format!("entry {id} has no created_at field")))?;
        let created_at = DateTime::from_timestamp_millis(created_ms)
            .ok_or_else(|| MqError::Message(format!("entry {id} has invalid created_at")))?;

        let expires_at = match field_string(map, FIELD_EXPIRES_AT) {
            Some(s) => {
                let ms = s
                    .parse::<i64>()
                    .map_err(|_| MqError::Message(format!("entry {id} has invalid expires_at")))?;
                Some(
                    DateTime::from_timestamp_millis(ms)
                        .ok_or_else(|| MqError::Message(format!("entry {id} has invalid expires_at")))?,
                )
            }
            None => None,
        };

        let delivery_count = field_string(map, FIELD_DELIVERY_COUNT)
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        Ok(Self {
            id,
            body,
            created_at,
            expires_at,
            delivery_count: delivery_count + delivery_bump,
        })
    }
}

/// Encode body plus metadata into stream fields.
pub(crate) fn encode_fields(
    body: &Value,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    delivery_count: u32,
) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        (FIELD_BODY, body.to_string()),
        (FIELD_CREATED_AT, created_at.timestamp_millis().to_string()),
    ];
    if let Some(deadline) = expires_at {
        fields.push((FIELD_EXPIRES_AT, deadline.timestamp_millis().to_string()));
    }
    fields.push((FIELD_DELIVERY_COUNT, delivery_count.to_string()));
    fields
}

/// Annotate a body object for dead-letter relocation.
pub(crate) fn annotate_dead_letter(body: &mut Value, reason: &str, source_queue: &str) {
    if let Some(map) = body.as_object_mut() {
        map.insert(KEY_ERROR.to_string(), Value::String(reason.to_string()));
        map.insert(
            KEY_SOURCE_QUEUE.to_string(),
            Value::String(source_queue.to_string()),
        );
        map.insert(
            KEY_MOVED_AT.to_string(),
            Value::from(Utc::now().timestamp_millis()),
        );
    }
}

/// Strip dead-letter annotations before requeueing.
pub(crate) fn strip_dead_letter(body: &mut Value) {
    if let Some(map) = body.as_object_mut() {
        map.remove(KEY_ERROR);
        map.remove(KEY_SOURCE_QUEUE);
        map.remove(KEY_MOVED_AT);
    }
}

/// Extract a string field from a raw stream entry.
pub(crate) fn field_string(map: &HashMap<String, redis::Value>, key: &str) -> Option<String> {
    map.get(key).and_then(|v| match v {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry_from_fields(fields: Vec<(&'static str, String)>) -> HashMap<String, redis::Value> {
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.into_bytes())))
            .collect()
    }

    #[test]
    fn test_wire_round_trip() {
        let body = json!({"order": "A-17", "n": 2});
        let created_at = Utc::now();
        let fields = encode_fields(&body, created_at, None, 0);
        let map = entry_from_fields(fields);

        let msg = Message::from_entry("1-0".to_string(), &map, 1).unwrap();
        assert_eq!(msg.body, body);
        assert_eq!(msg.created_at.timestamp_millis(), created_at.timestamp_millis());
        assert!(msg.expires_at.is_none());
        assert_eq!(msg.delivery_count, 1);
    }

    #[test]
    fn test_wire_round_trip_with_expiry() {
        let body = json!({"x": 1});
        let created_at = Utc::now();
        let deadline = created_at + chrono::Duration::seconds(30);
        let fields = encode_fields(&body, created_at, Some(deadline), 2);
        let map = entry_from_fields(fields);

        let msg = Message::from_entry("2-0".to_string(), &map, 0).unwrap();
        assert_eq!(
            msg.expires_at.unwrap().timestamp_millis(),
            deadline.timestamp_millis()
        );
        assert_eq!(msg.delivery_count, 2);
        assert!(!msg.is_expired(created_at));
        assert!(msg.is_expired(deadline + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_missing_body_is_an_error() {
        let map = entry_from_fields(vec![(FIELD_CREATED_AT, "0".to_string())]);
        let err = Message::from_entry("3-0".to_string(), &map, 0).unwrap_err();
        assert!(matches!(err, MqError::Message(_)));
    }

    #[test]
    fn test_missing_delivery_count_defaults_to_zero() {
        let body = json!({"k": "v"});
        let mut fields = encode_fields(&body, Utc::now(), None, 0);
        fields.retain(|(k, _)| *k != FIELD_DELIVERY_COUNT);
        let map = entry_from_fields(fields);

        let msg = Message::from_entry("4-0".to_string(), &map, 0).unwrap();
        assert_eq!(msg.delivery_count, 0);
    }

    #[test]
    fn test_dead_letter_annotations() {
        let mut body = json!({"x": 1});
        annotate_dead_letter(&mut body, "boom", "orders");

        assert_eq!(body[KEY_ERROR], "boom");
        assert_eq!(body[KEY_SOURCE_QUEUE], "orders");
        assert!(body[KEY_MOVED_AT].is_i64());

        strip_dead_letter(&mut body);
        assert_eq!(body, json!({"x": 1}));
    }
}
