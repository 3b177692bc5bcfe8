//! In-memory implementation of the event log
//!
//! Backs tests and local development without a Redis instance. Models
//! the parts of consumer-group semantics the bridge relies on: per-group
//! cursors, a pending set between delivery and acknowledgement, and
//! redelivery of unacknowledged entries.

use super::{EventLog, StreamEntry};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    cursor: usize,
    /// Delivered but not yet acknowledged, entry id -> index
    pending: HashMap<String, usize>,
    /// Unacked entries queued for redelivery ahead of new ones
    redeliver: VecDeque<usize>,
    /// Ids acknowledged, in ack order
    acked: Vec<String>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, Vec<(String, String)>)>,
    groups: HashMap<String, GroupState>,
    seq: u64,
}

/// In-memory event log with consumer-group semantics.
#[derive(Default)]
pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries ever appended to a stream.
    pub async fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry {
                        stream: stream.to_string(),
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids delivered to the group but not yet acknowledged.
    pub async fn pending(&self, stream: &str, group: &str) -> Vec<String> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids acknowledged by the group, in ack order.
    pub async fn acked(&self, stream: &str, group: &str) -> Vec<String> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.acked.clone())
            .unwrap_or_default()
    }

    /// Queue every pending entry for redelivery, as a crashed consumer's
    /// unacked deliveries would be handed to the next reader.
    pub async fn requeue_pending(&self, stream: &str, group: &str) {
        let mut streams = self.streams.lock().await;
        if let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            let mut indexes: Vec<usize> = group.pending.drain().map(|(_, idx)| idx).collect();
            indexes.sort_unstable();
            group.redeliver.extend(indexes);
        }
    }

    fn take_ready(
        state: &mut StreamState,
        stream: &str,
        group_name: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let group = state.groups.entry(group_name.to_string()).or_default();
        let mut out = Vec::new();

        while out.len() < count {
            let index = match group.redeliver.pop_front() {
                Some(index) => index,
                None if group.cursor < state.entries.len() => {
                    let index = group.cursor;
                    group.cursor += 1;
                    index
                }
                None => break,
            };
            let (id, fields) = &state.entries[index];
            group.pending.insert(id.clone(), index);
            out.push(StreamEntry {
                stream: stream.to_string(),
                id: id.clone(),
                fields: fields.clone(),
            });
        }

        out
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        state.seq += 1;
        let id = format!("{}-0", state.seq);
        state.entries.push((id.clone(), fields.to_vec()));
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let tip = state.entries.len();
        // Same "$" semantics as the Redis impl: a new group starts at
        // the tip; re-registering an existing group changes nothing.
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: tip,
                ..Default::default()
            });
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let _ = consumer;
        if count == 0 {
            return Err(AppError::StreamError {
                message: "read_group requires a non-zero count".into(),
            });
        }

        let mut out = Vec::new();
        {
            let mut guard = self.streams.lock().await;
            for stream in streams {
                let state = guard.entry(stream.clone()).or_default();
                let remaining = count - out.len();
                if remaining == 0 {
                    break;
                }
                out.extend(Self::take_ready(state, stream, group, remaining));
            }
        }

        // Model the blocking read: wait out the block interval once,
        // then check again so callers see newly appended entries.
        if out.is_empty() && !block.is_zero() {
            tokio::time::sleep(block.min(Duration::from_millis(20))).await;
            let mut guard = self.streams.lock().await;
            for stream in streams {
                let state = guard.entry(stream.clone()).or_default();
                let remaining = count - out.len();
                if remaining == 0 {
                    break;
                }
                out.extend(Self::take_ready(state, stream, group, remaining));
            }
        }

        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut streams = self.streams.lock().await;
        if let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            if group.pending.remove(entry_id).is_some() {
                group.acked.push(entry_id.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn group_reads_only_entries_after_registration() {
        let log = MemoryEventLog::new();
        log.append("metrics.calculated", &fields(&[("old", "1")]))
            .await
            .unwrap();
        log.ensure_group("metrics.calculated", "bridge").await.unwrap();
        log.append("metrics.calculated", &fields(&[("new", "2")]))
            .await
            .unwrap();

        let entries = log
            .read_group(
                &["metrics.calculated".to_string()],
                "bridge",
                "c1",
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields[0].0, "new");
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let log = MemoryEventLog::new();
        log.ensure_group("system.health", "bridge").await.unwrap();
        log.append("system.health", &fields(&[("ok", "true")]))
            .await
            .unwrap();
        // Re-registering must not reset the cursor past the entry
        log.ensure_group("system.health", "bridge").await.unwrap();

        let entries = log
            .read_group(
                &["system.health".to_string()],
                "bridge",
                "c1",
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn ack_moves_entry_out_of_pending() {
        let log = MemoryEventLog::new();
        log.ensure_group("gaps.identified", "bridge").await.unwrap();
        let id = log
            .append("gaps.identified", &fields(&[("gap", "posting-time")]))
            .await
            .unwrap();

        let read = log
            .read_group(
                &["gaps.identified".to_string()],
                "bridge",
                "c1",
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(log.pending("gaps.identified", "bridge").await, vec![id.clone()]);

        log.ack("gaps.identified", "bridge", &id).await.unwrap();
        assert!(log.pending("gaps.identified", "bridge").await.is_empty());
        assert_eq!(log.acked("gaps.identified", "bridge").await, vec![id]);
    }

    #[tokio::test]
    async fn unacked_entries_are_redelivered() {
        let log = MemoryEventLog::new();
        log.ensure_group("automation.status", "bridge").await.unwrap();
        let id = log
            .append("automation.status", &fields(&[("state", "running")]))
            .await
            .unwrap();

        let first = log
            .read_group(
                &["automation.status".to_string()],
                "bridge",
                "c1",
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Consumer dies before acking; entries go back on the queue
        log.requeue_pending("automation.status", "bridge").await;

        let second = log
            .read_group(
                &["automation.status".to_string()],
                "bridge",
                "c2",
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, id);
    }

    #[tokio::test]
    async fn read_respects_count_across_streams() {
        let log = MemoryEventLog::new();
        let streams = ["metrics.calculated".to_string(), "system.health".to_string()];
        for stream in &streams {
            log.ensure_group(stream, "bridge").await.unwrap();
        }
        for i in 0..3 {
            log.append("metrics.calculated", &fields(&[("n", &i.to_string())]))
                .await
                .unwrap();
            log.append("system.health", &fields(&[("n", &i.to_string())]))
                .await
                .unwrap();
        }

        let batch = log
            .read_group(&streams, "bridge", "c1", 4, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 4);
    }
}
