use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration, Instant};

use super::{ReadFrom, StreamLog};
use crate::error::PipelineError;
use crate::events::StreamEntry;
use crate::Result;

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    next: usize,
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamData {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

/// In-process stream log with Redis-like group semantics.
///
/// Entry ids are `"{n}-0"` with `n` starting at 1.
#[derive(Default)]
pub struct MemoryStreamLog {
    streams: Mutex<HashMap<String, StreamData>>,
    notifications: Mutex<Vec<(String, String)>>,
    published: Notify,
}

fn entry_id(index: usize) -> String {
    format!("{}-0", index + 1)
}

fn entry_index(id: &str) -> Option<usize> {
    id.split('-').next()?.parse::<usize>().ok()?.checked_sub(1)
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamData>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Snapshot of every entry in a stream.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock()
            .get(stream)
            .map(|data| data.entries.clone())
            .unwrap_or_default()
    }

    /// Entries of one event type, in order.
    pub fn entries_of(&self, stream: &str, event_type: &str) -> Vec<StreamEntry> {
        self.entries(stream)
            .into_iter()
            .filter(|e| e.event_type() == Some(event_type))
            .collect()
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|data| data.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Times an entry has been delivered, if it is still pending.
    pub fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u32> {
        let index = entry_index(id)?;
        self.lock()
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&index)
            .map(|p| p.deliveries)
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        match self.notifications.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.lock();
        let data = streams
            .get_mut(stream)
            .ok_or_else(|| PipelineError::Data(format!("stream {} does not exist", stream)))?;
        let state = data
            .groups
            .get_mut(group)
            .ok_or_else(|| PipelineError::Data(format!("no group {} on {}", group, stream)))?;

        let end = (state.next + count).min(data.entries.len());
        let mut out = Vec::with_capacity(end - state.next);
        for index in state.next..end {
            state.pending.insert(
                index,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            out.push(data.entries[index].clone());
        }
        state.next = end;
        Ok(out)
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.lock();
        let data = streams.entry(stream.to_string()).or_default();
        data.groups.entry(group.to_string()).or_default();
        Ok(())
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
        if let ReadFrom::PendingAfter(cursor) = &from {
            let mut streams = self.lock();
            let Some(data) = streams.get_mut(stream) else {
                return Ok(Vec::new());
            };
            let Some(state) = data.groups.get_mut(group) else {
                return Ok(Vec::new());
            };
            // "0" (or any id before "1-0") means from the start
            let start = entry_index(cursor).map_or(0, |i| i + 1);
            let mut out = Vec::new();
            for (index, pending) in state.pending.range_mut(start..) {
                if out.len() >= count {
                    break;
                }
                if pending.consumer == consumer {
                    pending.deliveries += 1;
                    pending.delivered_at = Instant::now();
                    out.push(data.entries[*index].clone());
                }
            }
            return Ok(out);
        }

        let notified = self.published.notified();
        let entries = self.take_new(stream, group, consumer, count)?;
        if !entries.is_empty() || block_ms == 0 {
            return Ok(entries);
        }

        // Nothing yet: wait for one publish or the block timeout.
        if timeout(Duration::from_millis(block_ms), notified).await.is_err() {
            return Ok(Vec::new());
        }
        self.take_new(stream, group, consumer, count)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let index = entry_index(id)
            .ok_or_else(|| PipelineError::Data(format!("invalid entry id {}", id)))?;
        let mut streams = self.lock();
        if let Some(state) = streams
            .get_mut(stream)
            .and_then(|data| data.groups.get_mut(group))
        {
            state.pending.remove(&index);
        }
        Ok(())
    }

    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let id = {
            let mut streams = self.lock();
            let data = streams.entry(stream.to_string()).or_default();
            let id = entry_id(data.entries.len());
            data.entries.push(StreamEntry {
                id: id.clone(),
                stream: stream.to_string(),
                fields: fields.iter().cloned().collect(),
            });
            id
        };
        self.published.notify_waiters();
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
        let mut streams = self.lock();
        let Some(data) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(state) = data.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let min_idle = Duration::from_millis(min_idle_ms);
        let mut out = Vec::new();
        for (index, pending) in state.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if pending.consumer != consumer && pending.delivered_at.elapsed() >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = Instant::now();
                pending.deliveries += 1;
                out.push(data.entries[*index].clone());
            }
        }
        Ok(out)
    }

    async fn notify(&self, channel: &str, message: &str) -> Result<()> {
        let mut guard = match self.notifications.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        Ok(self.lock().get(stream).map(|d| d.entries.len()).unwrap_or(0))
    }
}
