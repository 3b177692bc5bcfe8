//! Redis Streams implementation of the event log

use super::{EventLog, StreamEntry};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Event log backed by Redis Streams
/// (XADD / XGROUP CREATE / XREADGROUP / XACK).
pub struct RedisEventLog {
    connection: Mutex<ConnectionManager>,
}

impl RedisEventLog {
    /// Connect to Redis; the connection manager reconnects on its own
    /// after transient failures.
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::StreamError {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::StreamError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.connection.lock().await;

        let id: String = conn
            .xadd(stream, "*", fields)
            .await
            .map_err(|e| AppError::StreamError {
                message: format!("XADD to '{}' failed: {}", stream, e),
            })?;

        debug!(stream, entry_id = %id, "Appended entry");
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.connection.lock().await;

        // "$" so the group starts at the tip; MKSTREAM creates the
        // stream when producers have not written to it yet.
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "$")
            .await
        {
            Ok(()) => {
                debug!(stream, group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(AppError::StreamError {
                message: format!("XGROUP CREATE on '{}' failed: {}", stream, e),
            }),
        }
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.connection.lock().await;

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        // ">" asks for entries never delivered to this group
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let keys: Vec<&str> = streams.iter().map(String::as_str).collect();

        let reply: StreamReadReply = conn
            .xread_options(&keys, &ids, &options)
            .await
            .map_err(|e| AppError::StreamError {
                message: format!("XREADGROUP failed: {}", e),
            })?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = Vec::with_capacity(id.map.len());
                for (name, value) in id.map {
                    let raw: String =
                        redis::from_redis_value(&value).map_err(|e| AppError::StreamError {
                            message: format!("Non-string field '{}' in '{}': {}", name, key.key, e),
                        })?;
                    fields.push((name, raw));
                }
                entries.push(StreamEntry {
                    stream: key.key.clone(),
                    id: id.id,
                    fields,
                });
            }
        }

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.connection.lock().await;

        let _: i64 = conn
            .xack(stream, group, &[entry_id])
            .await
            .map_err(|e| AppError::StreamError {
                message: format!("XACK on '{}' failed: {}", stream, e),
            })?;

        Ok(())
    }
}
