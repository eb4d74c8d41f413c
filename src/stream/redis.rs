use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tokio::time::{timeout, Duration};

use super::{ReadFrom, StreamLog};
use crate::error::PipelineError;
use crate::events::StreamEntry;
use crate::Result;

/// Redis Streams backed log.
///
/// A blocking XREADGROUP holds its connection for up to the block timeout,
/// so every consumer worker should own its own `RedisStreamLog`.
#[derive(Clone)]
pub struct RedisStreamLog {
    conn: ConnectionManager,
}

impl RedisStreamLog {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| PipelineError::Timeout("Redis connection after 5 seconds".to_string()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn to_entry(stream: &str, id: StreamId) -> StreamEntry {
        let fields: HashMap<String, String> = id
            .map
            .iter()
            .filter_map(|(k, v)| redis::from_redis_value::<String>(v).ok().map(|s| (k.clone(), s)))
            .collect();
        StreamEntry {
            id: id.id,
            stream: stream.to_string(),
            fields,
        }
    }

    /// Split ids into readable entries and ids whose data was trimmed
    /// (returned by Redis without fields).
    fn split(stream: &str, ids: Vec<StreamId>) -> (Vec<StreamEntry>, Vec<String>) {
        let mut entries = Vec::with_capacity(ids.len());
        let mut trimmed = Vec::new();
        for id in ids {
            if id.map.is_empty() {
                trimmed.push(id.id);
            } else {
                entries.push(Self::to_entry(stream, id));
            }
        }
        (entries, trimmed)
    }

    /// Ack ids that can never be processed so they leave the pending list.
    async fn ack_trimmed(&self, stream: &str, group: &str, trimmed: &[String]) -> Result<()> {
        if trimmed.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            stream,
            group,
            "Acking {} pending entries whose data was trimmed",
            trimmed.len()
        );
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, trimmed).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => {
                tracing::info!("Created consumer group {} on {}", group, stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));

        let cursor = match from {
            ReadFrom::New => {
                if block_ms > 0 {
                    options = options.block(block_ms as usize);
                }
                let reply: Option<StreamReadReply> =
                    conn.xread_options(&[stream], &[">"], &options).await?;
                let ids: Vec<StreamId> = reply
                    .map(|r| r.keys.into_iter().flat_map(|key| key.ids).collect())
                    .unwrap_or_default();
                return Ok(Self::split(stream, ids).0);
            }
            ReadFrom::PendingAfter(cursor) => cursor,
        };

        loop {
            let reply: Option<StreamReadReply> =
                conn.xread_options(&[stream], &[cursor.as_str()], &options).await?;
            let ids: Vec<StreamId> = reply
                .map(|r| r.keys.into_iter().flat_map(|key| key.ids).collect())
                .unwrap_or_default();
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let (entries, trimmed) = Self::split(stream, ids);
            self.ack_trimmed(stream, group, &trimmed).await?;
            // A page of only trimmed ids is gone from the pending list now;
            // read the same cursor again.
            if !entries.is_empty() {
                return Ok(entries);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != consumer && p.last_delivered_ms as u64 >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms as usize, &stale)
            .await?;
        tracing::info!(
            "Claimed {} stale entries on {} for {}",
            claimed.ids.len(),
            stream,
            consumer
        );

        let (entries, trimmed) = Self::split(stream, claimed.ids);
        self.ack_trimmed(stream, group, &trimmed).await?;
        Ok(entries)
    }

    async fn notify(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.xlen(stream).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // Run with: cargo test --lib stream::redis -- --ignored

    #[tokio::test]
    #[ignore]
    async fn test_redis_group_round_trip() {
        let log = RedisStreamLog::connect("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        let stream = format!("test-stream-{}", uuid::Uuid::new_v4());

        log.ensure_group(&stream, "g").await.unwrap();
        log.ensure_group(&stream, "g").await.unwrap();
        let id = log
            .publish(&stream, &[("payload".to_string(), "{}".to_string())])
            .await
            .unwrap();

        let entries = log
            .read_group(&stream, "g", "c1", ReadFrom::New, 10, 100)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);

        let pending = log
            .read_group(&stream, "g", "c1", ReadFrom::pending(), 10, 0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        log.ack(&stream, "g", &id).await.unwrap();
        let pending = log
            .read_group(&stream, "g", "c1", ReadFrom::pending(), 10, 0)
            .await
            .unwrap();
        assert!(pending.is_empty());

        // A pending entry deleted from the stream is acked instead of returned.
        let gone = log
            .publish(&stream, &[("payload".to_string(), "{}".to_string())])
            .await
            .unwrap();
        log.read_group(&stream, "g", "c1", ReadFrom::New, 10, 100)
            .await
            .unwrap();
        let mut conn = log.connection();
        let _: i64 = conn.xdel(&stream, &[gone.as_str()]).await.unwrap();
        let pending = log
            .read_group(&stream, "g", "c1", ReadFrom::pending(), 10, 0)
            .await
            .unwrap();
        assert!(pending.is_empty());
        let summary: redis::streams::StreamPendingReply =
            conn.xpending(&stream, "g").await.unwrap();
        assert_eq!(summary.count(), 0);

        let _: () = conn.del(&stream).await.unwrap();
    }
}
