//! Event-log adapter
//!
//! An append-only, ordered log with consumer-group semantics: named
//! groups receive every entry once per group and acknowledge entries
//! explicitly. Backed by Redis Streams in production and by an in-memory
//! implementation in tests.

mod memory;
mod redis_log;

pub use memory::MemoryEventLog;
pub use redis_log::RedisEventLog;

use crate::errors::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

/// One entry fetched from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Stream the entry was read from
    pub stream: String,
    /// Log-assigned entry id
    pub id: String,
    /// Field/value pairs
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Decode fields best-effort: values that parse as JSON are kept as
    /// JSON, anything else passes through as a raw string.
    pub fn decoded_fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (key, raw) in &self.fields {
            let value = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.clone()));
            map.insert(key.clone(), value);
        }
        map
    }
}

/// Append, consumer-group read, and acknowledge against an ordered log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an entry; returns the log-assigned id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    /// Register a consumer group on a stream, creating the stream if
    /// needed. Idempotent: a group that already exists is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Blocking multi-stream read as a named consumer within a group.
    /// Returns after `block` at the latest, possibly with no entries.
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge one entry back to the group.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: &[(&str, &str)]) -> StreamEntry {
        StreamEntry {
            stream: "metrics.calculated".into(),
            id: "1-0".into(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn decode_parses_json_values() {
        let e = entry(&[("engagement", r#"{"likes": 10}"#), ("count", "42")]);
        let decoded = e.decoded_fields();
        assert_eq!(decoded["engagement"]["likes"], 10);
        assert_eq!(decoded["count"], 42);
    }

    #[test]
    fn decode_passes_raw_strings_through() {
        let e = entry(&[("status", "running"), ("note", "not {json")]);
        let decoded = e.decoded_fields();
        assert_eq!(decoded["status"], Value::String("running".into()));
        assert_eq!(decoded["note"], Value::String("not {json".into()));
    }

    #[test]
    fn decode_keeps_quoted_strings_as_json() {
        let e = entry(&[("label", r#""spike""#)]);
        let decoded = e.decoded_fields();
        assert_eq!(decoded["label"], Value::String("spike".into()));
    }
}
