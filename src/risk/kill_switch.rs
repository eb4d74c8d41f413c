//! Portfolio kill switch.
//!
//! One record per portfolio, shared by manual and automatic triggers.
//! Transitions are compare-and-set on the `active` flag so two triggers
//! racing each other produce exactly one activation.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::broker::Broker;
use crate::events::NOTIFICATIONS_CHANNEL;
use crate::models::{KillSwitchSource, KillSwitchState, Order};
use crate::store::TradingStore;
use crate::stream::StreamLog;
use crate::telemetry::{Alert, AlertLevel, Telemetry};
use crate::Result;

pub fn kill_switch_key(portfolio_id: &str) -> String {
    format!("kill_switch:{}", portfolio_id)
}

#[async_trait]
pub trait KillSwitchStore: Send + Sync {
    async fn load(&self, portfolio_id: &str) -> Result<KillSwitchState>;

    /// Write `next` only if the stored `active` flag equals `expected_active`.
    async fn compare_and_set(&self, expected_active: bool, next: &KillSwitchState) -> Result<bool>;
}

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local active = 'false'
if current then
    local ok, decoded = pcall(cjson.decode, current)
    if ok and decoded['active'] == true then
        active = 'true'
    end
end
if active == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Kill-switch record stored as JSON under `kill_switch:<portfolio>`.
#[derive(Clone)]
pub struct RedisKillSwitchStore {
    conn: ConnectionManager,
}

impl RedisKillSwitchStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KillSwitchStore for RedisKillSwitchStore {
    async fn load(&self, portfolio_id: &str) -> Result<KillSwitchState> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(kill_switch_key(portfolio_id)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(KillSwitchState::inactive(portfolio_id)),
        }
    }

    async fn compare_and_set(&self, expected_active: bool, next: &KillSwitchState) -> Result<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(next)?;
        let swapped: i64 = Script::new(CAS_SCRIPT)
            .key(kill_switch_key(&next.portfolio_id))
            .arg(if expected_active { "true" } else { "false" })
            .arg(json)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

#[derive(Default)]
pub struct MemoryKillSwitchStore {
    records: Mutex<HashMap<String, KillSwitchState>>,
}

impl MemoryKillSwitchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KillSwitchStore for MemoryKillSwitchStore {
    async fn load(&self, portfolio_id: &str) -> Result<KillSwitchState> {
        let records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(records
            .get(portfolio_id)
            .cloned()
            .unwrap_or_else(|| KillSwitchState::inactive(portfolio_id)))
    }

    async fn compare_and_set(&self, expected_active: bool, next: &KillSwitchState) -> Result<bool> {
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let active = records
            .get(&next.portfolio_id)
            .map(|r| r.active)
            .unwrap_or(false);
        if active != expected_active {
            return Ok(false);
        }
        records.insert(next.portfolio_id.clone(), next.clone());
        Ok(true)
    }
}

/// Kill-switch operations for one portfolio.
#[derive(Clone)]
pub struct KillSwitch {
    portfolio_id: String,
    records: Arc<dyn KillSwitchStore>,
    orders: Arc<dyn TradingStore>,
    stream: Arc<dyn StreamLog>,
    telemetry: Arc<dyn Telemetry>,
    broker: Option<Arc<dyn Broker>>,
}

impl KillSwitch {
    pub fn new(
        portfolio_id: &str,
        records: Arc<dyn KillSwitchStore>,
        orders: Arc<dyn TradingStore>,
        stream: Arc<dyn StreamLog>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            portfolio_id: portfolio_id.to_string(),
            records,
            orders,
            stream,
            telemetry,
            broker: None,
        }
    }

    /// Also cancel submitted orders at the broker on activation.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn portfolio_id(&self) -> &str {
        &self.portfolio_id
    }

    pub async fn state(&self) -> Result<KillSwitchState> {
        self.records.load(&self.portfolio_id).await
    }

    pub async fn is_active(&self) -> Result<bool> {
        Ok(self.state().await?.active)
    }

    /// Activate and cancel all pending-like orders. Returns false when the
    /// switch was already active.
    ///
    /// The cancel sweep runs on every call, so retrying after a failed
    /// sweep still cancels whatever an earlier activation left open.
    pub async fn activate(&self, reason: &str, source: KillSwitchSource) -> Result<bool> {
        let next = KillSwitchState {
            portfolio_id: self.portfolio_id.clone(),
            active: true,
            triggered_at: Some(Utc::now()),
            reason: Some(reason.to_string()),
            source: Some(source),
        };
        let activated = self.records.compare_and_set(false, &next).await?;
        if !activated {
            tracing::info!(portfolio = %self.portfolio_id, "Kill switch already active");
        }

        let canceled = self.cancel_open_orders(reason).await?;
        if !activated {
            if !canceled.is_empty() {
                tracing::warn!(
                    portfolio = %self.portfolio_id,
                    "Canceled {} orders left open by an earlier activation",
                    canceled.len()
                );
            }
            return Ok(false);
        }

        let level = match source {
            KillSwitchSource::Auto => AlertLevel::Critical,
            KillSwitchSource::Manual => AlertLevel::Warning,
        };
        let message = format!(
            "kill switch activated ({}): {}; {} orders canceled",
            source.as_str(),
            reason,
            canceled.len()
        );
        tracing::warn!(portfolio = %self.portfolio_id, "{}", message);
        self.announce(level, message).await;

        Ok(true)
    }

    async fn cancel_open_orders(&self, reason: &str) -> Result<Vec<Order>> {
        let canceled = self
            .orders
            .cancel_open_orders(&self.portfolio_id, &format!("kill switch: {}", reason))
            .await?;
        if let Some(broker) = &self.broker {
            for order in &canceled {
                if let Some(broker_id) = &order.broker_order_id {
                    if let Err(e) = broker.cancel_order(broker_id).await {
                        tracing::warn!(order_id = %order.order_id, "Broker cancel failed: {}", e);
                    }
                }
            }
        }
        Ok(canceled)
    }

    /// Returns false when the switch was not active.
    pub async fn deactivate(&self, reason: &str) -> Result<bool> {
        let next = KillSwitchState::inactive(&self.portfolio_id);
        if !self.records.compare_and_set(true, &next).await? {
            return Ok(false);
        }

        let message = format!("kill switch deactivated: {}", reason);
        tracing::info!(portfolio = %self.portfolio_id, "{}", message);
        self.announce(AlertLevel::Info, message).await;
        Ok(true)
    }

    async fn announce(&self, level: AlertLevel, message: String) {
        self.telemetry
            .alert(Alert::new(level, "kill_switch", &self.portfolio_id, message.clone()))
            .await;

        let notification = serde_json::json!({
            "type": "kill_switch",
            "portfolio_id": self.portfolio_id,
            "message": message,
        });
        if let Err(e) = self
            .stream
            .notify(NOTIFICATIONS_CHANNEL, &notification.to_string())
            .await
        {
            tracing::warn!("Failed to broadcast kill switch notification: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderSide, OrderStatus, OrderType};
    use crate::store::MemoryStore;
    use crate::stream::MemoryStreamLog;
    use crate::telemetry::BufferedTelemetry;
    use chrono::NaiveDate;

    struct Fixture {
        switch: KillSwitch,
        store: Arc<MemoryStore>,
        stream: Arc<MemoryStreamLog>,
        telemetry: Arc<BufferedTelemetry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let stream = Arc::new(MemoryStreamLog::new());
        let telemetry = Arc::new(BufferedTelemetry::default());
        let switch = KillSwitch::new(
            "main",
            Arc::new(MemoryKillSwitchStore::new()),
            store.clone(),
            stream.clone(),
            telemetry.clone(),
        );
        Fixture {
            switch,
            store,
            stream,
            telemetry,
        }
    }

    fn order(id: &str, symbol: &str, status: OrderStatus) -> Order {
        Order {
            order_id: id.to_string(),
            portfolio_id: "main".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            qty: 1.0,
            order_type: OrderType::MarketOnOpen,
            status,
            broker_order_id: None,
            rejection_reason: None,
        }
    }

    #[tokio::test]
    async fn test_activation_cancels_pending_orders() {
        let f = fixture();
        f.store.insert_order(&order("a", "SPY", OrderStatus::New)).await.unwrap();
        f.store.insert_order(&order("b", "QQQ", OrderStatus::Accepted)).await.unwrap();
        f.store.insert_order(&order("c", "IWM", OrderStatus::Filled)).await.unwrap();

        assert!(f.switch.activate("manual halt", KillSwitchSource::Manual).await.unwrap());

        let statuses: HashMap<String, OrderStatus> = f
            .store
            .orders()
            .into_iter()
            .map(|o| (o.order_id, o.status))
            .collect();
        assert_eq!(statuses["a"], OrderStatus::Canceled);
        assert_eq!(statuses["b"], OrderStatus::Canceled);
        assert_eq!(statuses["c"], OrderStatus::Filled);

        let state = f.switch.state().await.unwrap();
        assert!(state.active);
        assert_eq!(state.source, Some(KillSwitchSource::Manual));
        assert_eq!(f.telemetry.alerts().len(), 1);
        assert_eq!(f.stream.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_compare_and_set() {
        let f = fixture();
        assert!(f.switch.activate("breach", KillSwitchSource::Auto).await.unwrap());
        assert!(!f.switch.activate("breach again", KillSwitchSource::Auto).await.unwrap());
        assert_eq!(f.telemetry.alerts()[0].level, AlertLevel::Critical);

        assert!(f.switch.deactivate("reviewed").await.unwrap());
        assert!(!f.switch.deactivate("reviewed twice").await.unwrap());
        assert!(!f.switch.is_active().await.unwrap());
        assert_eq!(f.telemetry.alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_cancel_is_retried_while_active() {
        let f = fixture();
        f.store.insert_order(&order("a", "SPY", OrderStatus::PendingExecution)).await.unwrap();
        f.store.fail_next_cancels(1);

        assert!(f.switch.activate("breach", KillSwitchSource::Auto).await.is_err());
        assert!(f.switch.is_active().await.unwrap());
        assert_eq!(f.store.orders()[0].status, OrderStatus::PendingExecution);

        // Already active, but the retry still sweeps open orders.
        assert!(!f.switch.activate("breach", KillSwitchSource::Auto).await.unwrap());
        assert_eq!(f.store.orders()[0].status, OrderStatus::Canceled);
        assert!(f.telemetry.alerts().is_empty());
    }
}
