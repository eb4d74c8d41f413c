//! Consumer-group worker shared by every pipeline stage.
//!
//! Delivery is at-least-once: an entry is acknowledged only after its
//! handler finished or the entry was written to `<stream>-dlq`. Handlers
//! must therefore treat redelivery as a no-op.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ConsumerSettings;
use crate::events::{dlq_stream, DeadLetter, StreamEntry};
use crate::stream::{ReadFrom, StreamLog};
use crate::telemetry::{Metric, Telemetry};
use crate::Result;

/// What a handler did with an entry. Only errors are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Nothing to do (duplicate, no change, kill switch active).
    Skipped(String),
    /// Business-rule rejection recorded on the entity.
    Rejected(String),
    /// Left for a later pass (market closed, order still pending).
    Deferred(String),
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Outcome::Rejected(reason.into())
    }

    pub fn deferred(reason: impl Into<String>) -> Self {
        Outcome::Deferred(reason.into())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Skipped(_) => "skipped",
            Outcome::Rejected(_) => "rejected",
            Outcome::Deferred(_) => "deferred",
        }
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name used for logs and metric labels.
    fn name(&self) -> &str;

    async fn handle(&self, entry: &StreamEntry) -> Result<Outcome>;
}

/// How one entry left the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Handled(Outcome),
    DeadLettered { attempts: u32, error: String },
}

pub struct ConsumerRuntime {
    log: Arc<dyn StreamLog>,
    telemetry: Arc<dyn Telemetry>,
    settings: ConsumerSettings,
    consumer: String,
}

impl ConsumerRuntime {
    pub fn new(
        log: Arc<dyn StreamLog>,
        telemetry: Arc<dyn Telemetry>,
        settings: ConsumerSettings,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            log,
            telemetry,
            settings,
            consumer: consumer.into(),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Consume `stream` as part of `group` until `shutdown` turns true.
    ///
    /// Order on start: this consumer's own unacked entries, then entries
    /// idle on other consumers, then new entries. Stale entries are claimed
    /// again whenever `claim_idle_ms` has elapsed.
    ///
    /// Stream log failures (read, ack, dead-letter write) never end the
    /// loop: the worker backs off and re-reads its own pending entries, so
    /// an entry that could not be acked is handled again.
    pub async fn run(
        &self,
        stream: &str,
        group: &str,
        handler: &dyn StageHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(
            stream,
            group,
            consumer = %self.consumer,
            "Consumer started for stage {}",
            handler.name()
        );

        let claim_every = Duration::from_millis(self.settings.claim_idle_ms.max(1));
        let mut last_claim: Option<Instant> = None;
        let mut group_ready = false;
        let mut recover_pending = true;
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if failures > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff(failures - 1)) => {}
                    _ = shutdown.changed() => break,
                }
            }

            if !group_ready {
                match self.log.ensure_group(stream, group).await {
                    Ok(()) => group_ready = true,
                    Err(e) => {
                        failures = self.stream_failure(stream, "ensure_group", &e, failures).await;
                        continue;
                    }
                }
            }

            if recover_pending {
                match self.process_pending(stream, group, handler).await {
                    Ok(_) => recover_pending = false,
                    Err(e) => {
                        failures = self.stream_failure(stream, "recover", &e, failures).await;
                        continue;
                    }
                }
            }

            if last_claim.map_or(true, |t| t.elapsed() >= claim_every) {
                last_claim = Some(Instant::now());
                match self.claim(stream, group).await {
                    Ok(claimed) => {
                        if let Err(e) = self.process_all(stream, group, handler, &claimed).await {
                            failures = self.stream_failure(stream, "process", &e, failures).await;
                            recover_pending = true;
                            continue;
                        }
                    }
                    Err(e) => tracing::warn!(stream, group, "Claiming stale entries failed: {}", e),
                }
            }

            let entries = match self
                .log
                .read_group(
                    stream,
                    group,
                    &self.consumer,
                    ReadFrom::New,
                    self.settings.batch_size,
                    self.settings.block_ms,
                )
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    failures = self.stream_failure(stream, "read", &e, failures).await;
                    continue;
                }
            };

            // Entries left unprocessed after a failure are pending on this
            // consumer and are picked up by the recovery pass.
            if let Err(e) = self.process_all(stream, group, handler, &entries).await {
                failures = self.stream_failure(stream, "process", &e, failures).await;
                recover_pending = true;
                continue;
            }
            failures = 0;
        }

        tracing::info!(stream, group, consumer = %self.consumer, "Consumer stopped");
        Ok(())
    }

    /// Process everything currently deliverable without blocking. Returns
    /// the number of entries handled.
    pub async fn drain(&self, stream: &str, group: &str, handler: &dyn StageHandler) -> Result<usize> {
        self.log.ensure_group(stream, group).await?;
        let mut handled = self.process_pending(stream, group, handler).await?;
        loop {
            let entries = self
                .log
                .read_group(
                    stream,
                    group,
                    &self.consumer,
                    ReadFrom::New,
                    self.settings.batch_size,
                    0,
                )
                .await?;
            if entries.is_empty() {
                return Ok(handled);
            }
            self.process_all(stream, group, handler, &entries).await?;
            handled += entries.len();
        }
    }

    /// Re-handle this consumer's unacked entries, one page of
    /// `batch_size` at a time.
    async fn process_pending(
        &self,
        stream: &str,
        group: &str,
        handler: &dyn StageHandler,
    ) -> Result<usize> {
        let mut cursor = ReadFrom::pending();
        let mut handled = 0;
        loop {
            let page = self
                .log
                .read_group(
                    stream,
                    group,
                    &self.consumer,
                    cursor,
                    self.settings.batch_size.max(1),
                    0,
                )
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = ReadFrom::PendingAfter(last.id.clone());
            self.process_all(stream, group, handler, &page).await?;
            handled += page.len();
        }
        if handled > 0 {
            tracing::info!(stream, group, "Recovered {} unacked entries", handled);
        }
        Ok(handled)
    }

    async fn process_all(
        &self,
        stream: &str,
        group: &str,
        handler: &dyn StageHandler,
        entries: &[StreamEntry],
    ) -> Result<()> {
        for entry in entries {
            self.process(stream, group, handler, entry).await?;
        }
        Ok(())
    }

    async fn stream_failure(
        &self,
        stream: &str,
        step: &str,
        error: &crate::PipelineError,
        failures: u32,
    ) -> u32 {
        tracing::warn!(
            stream,
            consumer = %self.consumer,
            "Stream {} failed, backing off: {}",
            step,
            error
        );
        self.telemetry
            .record(
                Metric::new("consumer_stream_errors", 1.0)
                    .label("stream", stream)
                    .label("step", step),
            )
            .await;
        failures.saturating_add(1)
    }

    async fn claim(&self, stream: &str, group: &str) -> Result<Vec<StreamEntry>> {
        let claimed = self
            .log
            .claim_stale(
                stream,
                group,
                &self.consumer,
                self.settings.claim_idle_ms,
                self.settings.batch_size,
            )
            .await?;
        if !claimed.is_empty() {
            tracing::info!(stream, group, "Claimed {} stale entries", claimed.len());
        }
        Ok(claimed)
    }

    /// Run the handler with retries, dead-letter on failure, then ack.
    ///
    /// Returns an error only when the stream log itself fails (dead-letter
    /// write or ack); the entry then stays pending for redelivery.
    pub async fn process(
        &self,
        stream: &str,
        group: &str,
        handler: &dyn StageHandler,
        entry: &StreamEntry,
    ) -> Result<Delivery> {
        let mut attempt: u32 = 0;
        let delivery = loop {
            match handler.handle(entry).await {
                Ok(outcome) => {
                    match &outcome {
                        Outcome::Done => {
                            tracing::debug!(stream, id = %entry.id, "{} handled entry", handler.name())
                        }
                        Outcome::Skipped(reason) => {
                            tracing::debug!(stream, id = %entry.id, "{} skipped: {}", handler.name(), reason)
                        }
                        Outcome::Rejected(reason) | Outcome::Deferred(reason) => tracing::info!(
                            stream,
                            id = %entry.id,
                            "{} {}: {}",
                            handler.name(),
                            outcome.label(),
                            reason
                        ),
                    }
                    break Delivery::Handled(outcome);
                }
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    tracing::warn!(
                        stream,
                        id = %entry.id,
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        handler.name(),
                        attempt,
                        self.settings.max_retries,
                        delay,
                        e
                    );
                    self.telemetry
                        .record(Metric::new("consumer_retries", 1.0).label("stage", handler.name()))
                        .await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let error = e.to_string();
                    let dead = DeadLetter::from_entry(entry, &error)?;
                    self.log.publish(&dlq_stream(stream), &dead.fields()).await?;
                    tracing::error!(
                        stream,
                        id = %entry.id,
                        "{} dead-lettered entry after {} attempts: {}",
                        handler.name(),
                        attempt + 1,
                        error
                    );
                    break Delivery::DeadLettered {
                        attempts: attempt + 1,
                        error,
                    };
                }
            }
        };

        self.log.ack(stream, group, &entry.id).await?;

        let label = match &delivery {
            Delivery::Handled(outcome) => outcome.label(),
            Delivery::DeadLettered { .. } => "dead_lettered",
        };
        self.telemetry
            .record(
                Metric::new("consumer_entries", 1.0)
                    .label("stage", handler.name())
                    .label("outcome", label),
            )
            .await;

        Ok(delivery)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.settings.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::stream::MemoryStreamLog;
    use crate::telemetry::BufferedTelemetry;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Memory log whose first `ack_failures` acks fail like a dropped
    /// Redis connection.
    struct AckOutage {
        inner: MemoryStreamLog,
        ack_failures: AtomicU32,
    }

    #[async_trait]
    impl StreamLog for AckOutage {
        async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
            self.inner.ensure_group(stream, group).await
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
            self.inner
                .read_group(stream, group, consumer, from, count, block_ms)
                .await
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
            let left = self.ack_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.ack_failures.store(left - 1, Ordering::SeqCst);
                return Err(PipelineError::Timeout("XACK".into()));
            }
            self.inner.ack(stream, group, id).await
        }

        async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
            self.inner.publish(stream, fields).await
        }

        async fn claim_stale(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle_ms: u64,
            count: usize,
        ) -> Result<Vec<StreamEntry>> {
            self.inner
                .claim_stale(stream, group, consumer, min_idle_ms, count)
                .await
        }

        async fn notify(&self, channel: &str, message: &str) -> Result<()> {
            self.inner.notify(channel, message).await
        }

        async fn len(&self, stream: &str) -> Result<usize> {
            self.inner.len(stream).await
        }
    }

    /// Fails the first `failures` calls with the given error kind.
    struct Flaky {
        failures: u32,
        transient: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _entry: &StreamEntry) -> Result<Outcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.transient {
                    Err(PipelineError::broker_transient("503"))
                } else {
                    Err(PipelineError::Payload("bad json".into()))
                }
            } else {
                Ok(Outcome::Done)
            }
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            backoff_base_ms: 1,
            max_retries: 3,
            ..ConsumerSettings::default()
        }
    }

    async fn setup() -> (Arc<MemoryStreamLog>, Arc<BufferedTelemetry>, ConsumerRuntime) {
        let log = Arc::new(MemoryStreamLog::new());
        let telemetry = Arc::new(BufferedTelemetry::default());
        let runtime = ConsumerRuntime::new(log.clone(), telemetry.clone(), settings(), "w1");
        log.ensure_group("orders", "executor").await.unwrap();
        log.publish(
            "orders",
            &[("event_type".to_string(), "order_created".to_string())],
        )
        .await
        .unwrap();
        (log, telemetry, runtime)
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_acked() {
        let (log, telemetry, runtime) = setup().await;
        let handler = Flaky {
            failures: 2,
            transient: true,
            calls: AtomicU32::new(0),
        };

        assert_eq!(runtime.drain("orders", "executor", &handler).await.unwrap(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(log.pending_count("orders", "executor"), 0);
        assert_eq!(log.len("orders-dlq").await.unwrap(), 0);
        assert_eq!(telemetry.count("consumer_entries", "outcome", "done"), 1.0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dlq() {
        let (log, telemetry, runtime) = setup().await;
        let handler = Flaky {
            failures: 10,
            transient: true,
            calls: AtomicU32::new(0),
        };

        runtime.drain("orders", "executor", &handler).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        let dlq = log.entries("orders-dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].fields["original_id"], "1-0");
        assert!(dlq[0].fields["payload"].contains("order_created"));
        assert_eq!(log.pending_count("orders", "executor"), 0);
        assert_eq!(telemetry.count("consumer_entries", "outcome", "dead_lettered"), 1.0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_skips_backoff() {
        let (log, _telemetry, runtime) = setup().await;
        let handler = Flaky {
            failures: 1,
            transient: false,
            calls: AtomicU32::new(0),
        };

        runtime.drain("orders", "executor", &handler).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.len("orders-dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_recovers_pending_and_stops_on_shutdown() {
        let (log, _telemetry, runtime) = setup().await;
        // Delivered to w1 before a crash, never acked.
        log.read_group("orders", "executor", "w1", ReadFrom::New, 10, 0)
            .await
            .unwrap();
        assert_eq!(log.pending_count("orders", "executor"), 1);

        let handler = Flaky {
            failures: 0,
            transient: true,
            calls: AtomicU32::new(0),
        };
        let (tx, rx) = watch::channel(false);
        let runtime = ConsumerRuntime::new(
            log.clone(),
            Arc::new(BufferedTelemetry::default()),
            ConsumerSettings {
                block_ms: 20,
                ..settings()
            },
            runtime.consumer_name(),
        );

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
        });
        runtime.run("orders", "executor", &handler, rx).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.pending_count("orders", "executor"), 0);
    }

    #[tokio::test]
    async fn test_pending_recovery_pages_past_batch_size() {
        let log = Arc::new(MemoryStreamLog::new());
        log.ensure_group("fills", "ledger").await.unwrap();
        for _ in 0..7 {
            log.publish("fills", &[("event_type".to_string(), "fill_created".to_string())])
                .await
                .unwrap();
        }
        // All seven delivered to w1, which then crashed.
        log.read_group("fills", "ledger", "w1", ReadFrom::New, 100, 0)
            .await
            .unwrap();

        let runtime = ConsumerRuntime::new(
            log.clone(),
            Arc::new(BufferedTelemetry::default()),
            ConsumerSettings {
                batch_size: 3,
                ..settings()
            },
            "w1",
        );
        let handler = Flaky {
            failures: 0,
            transient: true,
            calls: AtomicU32::new(0),
        };

        assert_eq!(runtime.drain("fills", "ledger", &handler).await.unwrap(), 7);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 7);
        assert_eq!(log.pending_count("fills", "ledger"), 0);
    }

    #[tokio::test]
    async fn test_ack_failure_keeps_worker_running() {
        let _ = tracing_subscriber::fmt::try_init();
        let log = Arc::new(AckOutage {
            inner: MemoryStreamLog::new(),
            ack_failures: AtomicU32::new(1),
        });
        log.ensure_group("orders", "executor").await.unwrap();
        log.publish("orders", &[("event_type".to_string(), "order_created".to_string())])
            .await
            .unwrap();

        let telemetry = Arc::new(BufferedTelemetry::default());
        let runtime = ConsumerRuntime::new(
            log.clone(),
            telemetry.clone(),
            ConsumerSettings {
                block_ms: 10,
                ..settings()
            },
            "w1",
        );
        let handler = Flaky {
            failures: 0,
            transient: true,
            calls: AtomicU32::new(0),
        };

        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.send(true).unwrap();
        });
        tokio_test::assert_ok!(runtime.run("orders", "executor", &handler, rx).await);
        stopper.await.unwrap();

        // Handled once, ack failed, handled again from the pending list.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(log.inner.pending_count("orders", "executor"), 0);
        assert_eq!(telemetry.count("consumer_stream_errors", "step", "process"), 1.0);
    }
}
