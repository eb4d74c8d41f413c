//! Durable stream log abstraction (consumer groups, pending entries, acks).

pub mod memory;
pub mod redis;

pub use memory::MemoryStreamLog;
pub use self::redis::RedisStreamLog;

use async_trait::async_trait;
use serde::Serialize;

use crate::events::{encode, StreamEntry};
use crate::Result;

/// Which entries a group read returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries already delivered to this consumer and not yet acked, with
    /// ids strictly after the cursor (`"0"` starts from the beginning).
    PendingAfter(String),
    /// Entries never delivered to the group.
    New,
}

impl ReadFrom {
    /// All of this consumer's pending entries, from the oldest.
    pub fn pending() -> Self {
        ReadFrom::PendingAfter("0".to_string())
    }
}

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create the consumer group (and stream) if missing.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read up to `count` entries for `consumer`. New reads block for at
    /// most `block_ms`; pending reads never block. Pending entries whose
    /// data no longer exists are acked and left out.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Append an entry, returning its id.
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    /// Take over entries pending on other consumers for at least `min_idle_ms`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Fire-and-forget broadcast on a pub/sub channel.
    async fn notify(&self, channel: &str, message: &str) -> Result<()>;

    async fn len(&self, stream: &str) -> Result<usize>;
}

/// Encode and append a tagged event.
pub async fn publish_event<E: Serialize + Sync>(
    log: &dyn StreamLog,
    stream: &str,
    event: &E,
) -> Result<String> {
    let fields = encode(event)?;
    log.publish(stream, &fields).await
}
