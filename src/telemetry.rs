//! Metrics and alerts port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::events::{ALERTS_STREAM, METRICS_STREAM};
use crate::stream::StreamLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            labels: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub source: String,
    pub portfolio_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, source: &str, portfolio_id: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.to_string(),
            portfolio_id: portfolio_id.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink for metrics and alerts. Implementations never fail the caller.
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn record(&self, metric: Metric);
    async fn alert(&self, alert: Alert);
}

/// Bounded in-memory sink for tests and dry runs.
pub struct BufferedTelemetry {
    capacity: usize,
    metrics: Mutex<VecDeque<Metric>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl BufferedTelemetry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            metrics: Mutex::new(VecDeque::with_capacity(capacity)),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn metrics(&self) -> Vec<Metric> {
        match self.metrics.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        match self.alerts.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Sum of values for metrics with this name and label value.
    pub fn count(&self, name: &str, label: &str, value: &str) -> f64 {
        self.metrics()
            .iter()
            .filter(|m| m.name == name && m.labels.get(label).map(String::as_str) == Some(value))
            .map(|m| m.value)
            .sum()
    }

    fn push<T>(buffer: &Mutex<VecDeque<T>>, capacity: usize, item: T) {
        let mut guard = match buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.len() >= capacity {
            guard.pop_front();
        }
        guard.push_back(item);
    }
}

impl Default for BufferedTelemetry {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl Telemetry for BufferedTelemetry {
    async fn record(&self, metric: Metric) {
        Self::push(&self.metrics, self.capacity, metric);
    }

    async fn alert(&self, alert: Alert) {
        Self::push(&self.alerts, self.capacity, alert);
    }
}

/// Publishes metrics and alerts to their streams.
pub struct StreamTelemetry {
    stream: Arc<dyn StreamLog>,
}

impl StreamTelemetry {
    pub fn new(stream: Arc<dyn StreamLog>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Telemetry for StreamTelemetry {
    async fn record(&self, metric: Metric) {
        let fields = vec![
            ("name".to_string(), metric.name.clone()),
            ("value".to_string(), metric.value.to_string()),
            (
                "labels".to_string(),
                serde_json::to_string(&metric.labels).unwrap_or_default(),
            ),
            ("timestamp".to_string(), metric.timestamp.to_rfc3339()),
        ];
        if let Err(e) = self.stream.publish(METRICS_STREAM, &fields).await {
            tracing::warn!(metric = %metric.name, "Failed to publish metric: {}", e);
        }
    }

    async fn alert(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Critical => tracing::error!(source = %alert.source, "CRITICAL: {}", alert.message),
            AlertLevel::Warning => tracing::warn!(source = %alert.source, "{}", alert.message),
            AlertLevel::Info => tracing::info!(source = %alert.source, "{}", alert.message),
        }

        let level = serde_json::to_value(alert.level)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let fields = vec![
            ("level".to_string(), level),
            ("source".to_string(), alert.source.clone()),
            ("portfolio_id".to_string(), alert.portfolio_id.clone()),
            ("message".to_string(), alert.message.clone()),
            ("timestamp".to_string(), alert.timestamp.to_rfc3339()),
        ];
        if let Err(e) = self.stream.publish(ALERTS_STREAM, &fields).await {
            tracing::warn!("Failed to publish alert: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MemoryStreamLog, StreamLog};

    #[tokio::test]
    async fn test_buffer_drops_oldest_when_full() {
        let telemetry = BufferedTelemetry::new(2);
        telemetry.record(Metric::new("a", 1.0)).await;
        telemetry.record(Metric::new("b", 1.0)).await;
        telemetry.record(Metric::new("c", 1.0)).await;

        let names: Vec<String> = telemetry.metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_stream_telemetry_publishes_alerts() {
        let stream = Arc::new(MemoryStreamLog::new());
        let telemetry = StreamTelemetry::new(stream.clone());

        telemetry
            .alert(Alert::new(AlertLevel::Critical, "ledger", "main", "drawdown breached"))
            .await;

        let entries = stream.entries(ALERTS_STREAM);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields["level"], "CRITICAL");
        assert_eq!(entries[0].fields["message"], "drawdown breached");
        assert_eq!(stream.len(METRICS_STREAM).await.unwrap(), 0);
    }
}
