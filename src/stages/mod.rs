//! Pipeline stage processors.
//!
//! Each stage is a [`StageHandler`] fed by one consumer group. Stages
//! share nothing in process; all collaborators are injected through
//! [`StageContext`].

pub mod broker_executor;
pub mod exit_evaluator;
pub mod ledger;
pub mod order_generator;
pub mod risk_optimizer;
pub mod signal_generator;

pub use broker_executor::BrokerExecutor;
pub use exit_evaluator::ExitEvaluator;
pub use ledger::LedgerAccountant;
pub use order_generator::OrderGenerator;
pub use risk_optimizer::RiskOptimizer;
pub use signal_generator::SignalGenerator;

pub use crate::consumer::{Outcome, StageHandler};

use serde::Serialize;
use std::sync::Arc;

use crate::config::ParamsHandle;
use crate::data::MarketData;
use crate::events::{
    BARS_STREAM, FILLS_STREAM, ORDERS_STREAM, SIGNALS_STREAM, TARGETS_STREAM,
};
use crate::risk::KillSwitch;
use crate::store::TradingStore;
use crate::stream::{publish_event, StreamLog};
use crate::telemetry::{Metric, Telemetry};
use crate::Result;

/// Stage identity: input stream and consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Signals,
    Optimizer,
    Exits,
    Orders,
    Executor,
    Ledger,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Signals,
        Stage::Optimizer,
        Stage::Exits,
        Stage::Orders,
        Stage::Executor,
        Stage::Ledger,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Signals => "signal_generator",
            Stage::Optimizer => "risk_optimizer",
            Stage::Exits => "exit_evaluator",
            Stage::Orders => "order_generator",
            Stage::Executor => "broker_executor",
            Stage::Ledger => "ledger",
        }
    }

    pub fn input_stream(self) -> &'static str {
        match self {
            Stage::Signals | Stage::Exits => BARS_STREAM,
            Stage::Optimizer => SIGNALS_STREAM,
            Stage::Orders => TARGETS_STREAM,
            Stage::Executor => ORDERS_STREAM,
            Stage::Ledger => FILLS_STREAM,
        }
    }

    /// Consumer group; one per stage so every stage sees every entry.
    pub fn group(self) -> &'static str {
        self.name()
    }

    pub fn parse(name: &str) -> Option<Stage> {
        let name = name.replace('-', "_");
        Stage::ALL.into_iter().find(|s| s.name() == name || s.short() == name)
    }

    fn short(self) -> &'static str {
        match self {
            Stage::Signals => "signals",
            Stage::Optimizer => "optimizer",
            Stage::Exits => "exits",
            Stage::Orders => "orders",
            Stage::Executor => "executor",
            Stage::Ledger => "ledger",
        }
    }
}

/// Collaborators shared by the stages of one portfolio.
#[derive(Clone)]
pub struct StageContext {
    pub portfolio_id: String,
    pub initial_capital: f64,
    pub store: Arc<dyn TradingStore>,
    pub market: Arc<dyn MarketData>,
    pub stream: Arc<dyn StreamLog>,
    pub telemetry: Arc<dyn Telemetry>,
    pub kill_switch: KillSwitch,
    pub params: ParamsHandle,
}

impl StageContext {
    pub async fn publish<E: Serialize + Sync>(&self, stream: &str, event: &E) -> Result<String> {
        publish_event(self.stream.as_ref(), stream, event).await
    }

    /// Latest ledger NAV, or the configured capital before the first fill.
    pub async fn nav(&self) -> Result<f64> {
        Ok(self
            .store
            .latest_portfolio_state(&self.portfolio_id)
            .await?
            .map(|s| s.nav)
            .filter(|nav| *nav > 0.0)
            .unwrap_or(self.initial_capital))
    }

    pub async fn count(&self, name: &str, stage: Stage, outcome: &str) {
        self.telemetry
            .record(
                Metric::new(name, 1.0)
                    .label("stage", stage.name())
                    .label("outcome", outcome),
            )
            .await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared in-memory fixtures for stage tests.

    use super::*;
    use crate::config::StrategyParams;
    use crate::models::Bar;
    use crate::risk::MemoryKillSwitchStore;
    use crate::store::MemoryStore;
    use crate::stream::MemoryStreamLog;
    use crate::telemetry::BufferedTelemetry;
    use chrono::{Duration, NaiveDate};

    pub struct Harness {
        pub ctx: StageContext,
        pub store: Arc<MemoryStore>,
        pub stream: Arc<MemoryStreamLog>,
        pub telemetry: Arc<BufferedTelemetry>,
    }

    pub fn harness(params: StrategyParams) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let stream = Arc::new(MemoryStreamLog::new());
        let telemetry = Arc::new(BufferedTelemetry::default());
        let kill_switch = KillSwitch::new(
            "main",
            Arc::new(MemoryKillSwitchStore::new()),
            store.clone(),
            stream.clone(),
            telemetry.clone(),
        );
        let ctx = StageContext {
            portfolio_id: "main".to_string(),
            initial_capital: 100_000.0,
            store: store.clone(),
            market: store.clone(),
            stream: stream.clone(),
            telemetry: telemetry.clone(),
            kill_switch,
            params: ParamsHandle::new(params),
        };
        Harness {
            ctx,
            store,
            stream,
            telemetry,
        }
    }

    /// Daily bars with high/low one unit around the close.
    pub fn bars(symbol: &str, end: NaiveDate, closes: &[f64]) -> Vec<Bar> {
        let n = closes.len() as i64;
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Bar {
                symbol: symbol.to_string(),
                date: end - Duration::days(n - 1 - i as i64),
                open: *close,
                high: Some(close + 1.0),
                low: Some(close - 1.0),
                close: *close,
                volume: 1_000_000.0,
            })
            .collect()
    }

    /// Stream log whose next `failures` publishes to `stream` time out.
    pub struct FlakyStream {
        pub inner: Arc<MemoryStreamLog>,
        stream: String,
        failures: std::sync::atomic::AtomicU32,
    }

    impl FlakyStream {
        pub fn new(inner: Arc<MemoryStreamLog>, stream: &str, failures: u32) -> Self {
            Self {
                inner,
                stream: stream.to_string(),
                failures: std::sync::atomic::AtomicU32::new(failures),
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamLog for FlakyStream {
        async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
            self.inner.ensure_group(stream, group).await
        }

        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            from: crate::stream::ReadFrom,
            count: usize,
            block_ms: u64,
        ) -> Result<Vec<crate::events::StreamEntry>> {
            self.inner
                .read_group(stream, group, consumer, from, count, block_ms)
                .await
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
            self.inner.ack(stream, group, id).await
        }

        async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
            use std::sync::atomic::Ordering;
            if stream == self.stream {
                let left = self.failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures.store(left - 1, Ordering::SeqCst);
                    return Err(crate::PipelineError::Timeout(format!("XADD {}", stream)));
                }
            }
            self.inner.publish(stream, fields).await
        }

        async fn claim_stale(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle_ms: u64,
            count: usize,
        ) -> Result<Vec<crate::events::StreamEntry>> {
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

    /// Geometric drift from `start`.
    pub fn trending(start: f64, daily: f64, days: usize) -> Vec<f64> {
        (0..days).map(|i| start * (1.0 + daily).powi(i as i32)).collect()
    }

    /// Drift plus a deterministic wiggle so volatility is non-zero.
    pub fn noisy_trend(start: f64, daily: f64, days: usize) -> Vec<f64> {
        (0..days)
            .map(|i| {
                let wiggle = if i % 2 == 0 { 1.004 } else { 0.997 };
                start * (1.0 + daily).powi(i as i32) * wiggle
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_parse() {
        assert_eq!(Stage::parse("signals"), Some(Stage::Signals));
        assert_eq!(Stage::parse("broker-executor"), Some(Stage::Executor));
        assert_eq!(Stage::parse("ledger"), Some(Stage::Ledger));
        assert_eq!(Stage::parse("backtest"), None);
        assert_eq!(Stage::Exits.input_stream(), BARS_STREAM);
        assert_ne!(Stage::Exits.group(), Stage::Signals.group());
    }
}
