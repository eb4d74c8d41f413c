use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    Broker, BrokerOrder, BrokerOrderRequest, BrokerOrderStatus, BrokerPosition, MarketClock,
    TimeInForce,
};
use crate::data::FetchDailyBars;
use crate::error::PipelineError;
use crate::Result;

#[derive(Default)]
struct PaperState {
    orders: HashMap<String, BrokerOrder>,
    requests: HashMap<String, BrokerOrderRequest>,
    by_client_id: HashMap<String, String>,
    positions: HashMap<String, f64>,
    prices: HashMap<String, f64>,
    next_id: u64,
    market_open: bool,
    fill_market_orders: bool,
    submissions: usize,
}

/// In-memory broker for dry runs and tests.
///
/// Day orders fill immediately at the last known price when
/// `fill_market_orders` is on. Opening-auction orders stay accepted until
/// [`PaperBroker::fill_open_orders`] runs.
#[derive(Clone)]
pub struct PaperBroker {
    state: Arc<Mutex<PaperState>>,
    market: Option<Arc<dyn FetchDailyBars>>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        let state = PaperState {
            market_open: true,
            fill_market_orders: true,
            ..PaperState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            market: None,
        }
    }

    /// Fall back to the latest stored close when no price was set.
    pub fn with_market_data(mut self, market: Arc<dyn FetchDailyBars>) -> Self {
        self.market = Some(market);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_position(&self, symbol: &str, qty: f64) {
        self.lock().positions.insert(symbol.to_string(), qty);
    }

    pub fn set_market_open(&self, open: bool) {
        self.lock().market_open = open;
    }

    /// When off, day orders stay accepted so fill waits time out.
    pub fn set_fill_market_orders(&self, fill: bool) {
        self.lock().fill_market_orders = fill;
    }

    /// Number of submit calls that created a new broker order.
    pub fn submissions(&self) -> usize {
        self.lock().submissions
    }

    pub fn position(&self, symbol: &str) -> f64 {
        self.lock().positions.get(symbol).copied().unwrap_or(0.0)
    }

    /// Fill every accepted order at the current price (the opening auction).
    pub fn fill_open_orders(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.status == BrokerOrderStatus::Accepted)
            .map(|o| o.id.clone())
            .collect();

        let mut filled = 0;
        for id in ids {
            if Self::fill_locked(&mut state, &id) {
                filled += 1;
            }
        }
        filled
    }

    fn fill_locked(state: &mut PaperState, id: &str) -> bool {
        let Some(request) = state.requests.get(id).cloned() else {
            return false;
        };
        let Some(price) = state.prices.get(&request.symbol).copied() else {
            return false;
        };
        if let Some(order) = state.orders.get_mut(id) {
            order.status = BrokerOrderStatus::Filled;
            order.filled_qty = request.qty;
            order.filled_avg_price = Some(price);
            order.filled_at = Some(Utc::now());
        }
        *state.positions.entry(request.symbol.clone()).or_insert(0.0) +=
            request.side.sign() * request.qty;
        true
    }

    async fn price_for(&self, symbol: &str) -> Result<Option<f64>> {
        if let Some(price) = self.lock().prices.get(symbol).copied() {
            return Ok(Some(price));
        }
        match &self.market {
            Some(market) => {
                let price = market
                    .latest_close(symbol, Utc::now().date_naive())
                    .await?;
                if let Some(price) = price {
                    self.set_price(symbol, price);
                }
                Ok(price)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrder> {
        if request.qty <= 0.0 {
            return Err(PipelineError::broker_rejected("qty must be positive"));
        }
        // Resolve a price before taking the lock so fills have one.
        self.price_for(&request.symbol).await?;

        let mut state = self.lock();
        if let Some(existing) = state.by_client_id.get(&request.client_order_id) {
            return Err(PipelineError::broker_rejected(format!(
                "client_order_id {} must be unique (order {})",
                request.client_order_id, existing
            )));
        }

        state.next_id += 1;
        state.submissions += 1;
        let id = format!("paper-{}", state.next_id);
        let order = BrokerOrder {
            id: id.clone(),
            client_order_id: request.client_order_id.clone(),
            status: BrokerOrderStatus::Accepted,
            filled_qty: 0.0,
            filled_avg_price: None,
            filled_at: None,
        };
        state.orders.insert(id.clone(), order);
        state.requests.insert(id.clone(), request.clone());
        state
            .by_client_id
            .insert(request.client_order_id.clone(), id.clone());

        if request.time_in_force == TimeInForce::Day && state.fill_market_orders {
            Self::fill_locked(&mut state, &id);
        }

        state
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::broker_transient("paper order vanished"))
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder> {
        self.lock()
            .orders
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| PipelineError::broker_rejected(format!("unknown order {}", broker_order_id)))
    }

    async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<BrokerOrder>> {
        let state = self.lock();
        Ok(state
            .by_client_id
            .get(client_order_id)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
        let qty = self.position(symbol);
        if qty.abs() < 1e-9 {
            return Ok(None);
        }
        Ok(Some(BrokerPosition {
            symbol: symbol.to_string(),
            qty,
        }))
    }

    async fn get_clock(&self) -> Result<MarketClock> {
        Ok(MarketClock {
            is_open: self.lock().market_open,
            timestamp: Utc::now(),
            next_open: None,
            next_close: None,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<()> {
        if let Some(order) = self.lock().orders.get_mut(broker_order_id) {
            if order.status != BrokerOrderStatus::Filled {
                order.status = BrokerOrderStatus::Canceled;
            }
        }
        Ok(())
    }

    async fn latest_trade_price(&self, symbol: &str) -> Result<Option<f64>> {
        self.price_for(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;

    fn request(id: &str, tif: TimeInForce) -> BrokerOrderRequest {
        BrokerOrderRequest {
            client_order_id: id.to_string(),
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            qty: 2.0,
            time_in_force: tif,
        }
    }

    #[tokio::test]
    async fn test_day_order_fills_at_price() {
        let broker = PaperBroker::new();
        broker.set_price("SPY", 500.0);

        let order = broker.submit_order(&request("o-1", TimeInForce::Day)).await.unwrap();

        assert!(order.is_filled());
        assert_eq!(order.filled_avg_price, Some(500.0));
        assert_eq!(broker.position("SPY"), 2.0);
    }

    #[tokio::test]
    async fn test_opening_orders_wait_for_auction() {
        let broker = PaperBroker::new();
        broker.set_price("SPY", 500.0);

        let order = broker.submit_order(&request("o-1", TimeInForce::Opg)).await.unwrap();
        assert_eq!(order.status, BrokerOrderStatus::Accepted);

        assert_eq!(broker.fill_open_orders(), 1);
        assert!(broker.get_order(&order.id).await.unwrap().is_filled());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_is_rejected() {
        let broker = PaperBroker::new();
        broker.set_price("SPY", 500.0);
        broker.submit_order(&request("o-1", TimeInForce::Opg)).await.unwrap();

        let err = broker
            .submit_order(&request("o-1", TimeInForce::Opg))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(broker.submissions(), 1);
        assert!(broker.get_order_by_client_id("o-1").await.unwrap().is_some());
    }
}
