use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output record handed to a `Sink`.
///
/// `key` carries the idempotency key for windowed streams (window identity,
/// optionally with the group); raw rows are unkeyed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub key: Option<String>,
    pub event_time: DateTime<Utc>,
    pub value: serde_json::Value,
}

impl Record {
    pub fn new(event_time: DateTime<Utc>, value: serde_json::Value) -> Self {
        Self {
            key: None,
            event_time,
            value,
        }
    }

    pub fn keyed(
        key: impl Into<String>,
        event_time: DateTime<Utc>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            key: Some(key.into()),
            event_time,
            value,
        }
    }
}

/// An opaque message as delivered by a source, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: u32,
    /// Source position (file line, kafka offset), when the source has one.
    pub offset: Option<i64>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(partition: u32, payload: Vec<u8>) -> Self {
        Self {
            partition,
            offset: None,
            payload,
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}
