use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{LedgerCommit, TradingStore};
use crate::data::{FetchDailyBars, FetchFundamentals, FetchMarketContext};
use crate::models::{
    Bar, Fill, Fundamentals, Holding, Instrument, MarketContext, Order, OrderStatus,
    PortfolioState, PositionState, Signal, TargetExposure,
};
use crate::error::PipelineError;
use crate::Result;

type SignalKey = (String, NaiveDate, String);
type TargetKey = (String, NaiveDate, String);
type SymbolKey = (String, String);

#[derive(Default)]
struct Inner {
    bars: HashMap<String, BTreeMap<NaiveDate, Bar>>,
    instruments: HashMap<String, Instrument>,
    fundamentals: HashMap<String, Fundamentals>,
    contexts: BTreeMap<NaiveDate, MarketContext>,
    signals: BTreeMap<SignalKey, Signal>,
    targets: BTreeMap<TargetKey, TargetExposure>,
    orders: BTreeMap<String, Order>,
    fills: BTreeMap<String, Fill>,
    processed_fills: HashSet<String>,
    holdings: BTreeMap<SymbolKey, Holding>,
    states: Vec<PortfolioState>,
    positions: BTreeMap<SymbolKey, PositionState>,
    params: BTreeMap<String, String>,
}

impl Inner {
    /// Later pushes win among equal dates, like ORDER BY date, id.
    fn latest_state(&self, portfolio_id: &str) -> Option<&PortfolioState> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.portfolio_id == portfolio_id)
            .max_by_key(|(i, s)| (s.date, *i))
            .map(|(_, s)| s)
    }
}

/// In-memory store with the same uniqueness rules as the Postgres schema.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    cancel_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert_bars(&self, bars: &[Bar]) {
        let mut inner = self.lock();
        for bar in bars {
            inner
                .bars
                .entry(bar.symbol.clone())
                .or_default()
                .insert(bar.date, bar.clone());
        }
    }

    pub fn insert_instrument(&self, instrument: Instrument) {
        self.lock()
            .instruments
            .insert(instrument.symbol.clone(), instrument);
    }

    pub fn insert_fundamentals(&self, fundamentals: Fundamentals) {
        self.lock()
            .fundamentals
            .insert(fundamentals.symbol.clone(), fundamentals);
    }

    pub fn insert_market_context(&self, context: MarketContext) {
        self.lock().contexts.insert(context.date, context);
    }

    pub fn insert_holding(&self, holding: Holding) {
        self.lock().holdings.insert(
            (holding.portfolio_id.clone(), holding.symbol.clone()),
            holding,
        );
    }

    pub fn insert_portfolio_state(&self, state: PortfolioState) {
        self.lock().states.push(state);
    }

    /// Fail the next `n` calls to `cancel_open_orders` with a timeout.
    pub fn fail_next_cancels(&self, n: u32) {
        self.cancel_failures.store(n, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<Order> {
        self.lock().orders.values().cloned().collect()
    }

    pub fn fills(&self) -> Vec<Fill> {
        self.lock().fills.values().cloned().collect()
    }

    pub fn targets(&self) -> Vec<TargetExposure> {
        self.lock().targets.values().cloned().collect()
    }

    pub fn portfolio_states(&self, portfolio_id: &str) -> Vec<PortfolioState> {
        self.lock()
            .states
            .iter()
            .filter(|s| s.portfolio_id == portfolio_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TradingStore for MemoryStore {
    async fn upsert_signal(&self, signal: &Signal) -> Result<()> {
        let key = (
            signal.strategy_version.clone(),
            signal.date,
            signal.symbol.clone(),
        );
        self.lock().signals.insert(key, signal.clone());
        Ok(())
    }

    async fn latest_signal_date(
        &self,
        strategy: &str,
        on_or_before: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        Ok(self
            .lock()
            .signals
            .keys()
            .filter(|(s, date, _)| s == strategy && *date <= on_or_before)
            .map(|(_, date, _)| *date)
            .max())
    }

    async fn signals_for_date(&self, strategy: &str, date: NaiveDate) -> Result<Vec<Signal>> {
        Ok(self
            .lock()
            .signals
            .iter()
            .filter(|((s, d, _), _)| s == strategy && *d == date)
            .map(|(_, signal)| signal.clone())
            .collect())
    }

    async fn latest_signal(
        &self,
        strategy: &str,
        symbol: &str,
        on_or_before: NaiveDate,
    ) -> Result<Option<Signal>> {
        Ok(self
            .lock()
            .signals
            .iter()
            .filter(|((s, d, sym), _)| s == strategy && sym == symbol && *d <= on_or_before)
            .max_by_key(|((_, d, _), _)| *d)
            .map(|(_, signal)| signal.clone()))
    }

    async fn target(
        &self,
        portfolio_id: &str,
        date: NaiveDate,
        symbol: &str,
    ) -> Result<Option<TargetExposure>> {
        let key = (portfolio_id.to_string(), date, symbol.to_string());
        Ok(self.lock().targets.get(&key).cloned())
    }

    async fn upsert_target_if_changed(&self, target: &TargetExposure) -> Result<bool> {
        let key = (
            target.portfolio_id.clone(),
            target.date,
            target.symbol.clone(),
        );
        let mut inner = self.lock();
        if let Some(existing) = inner.targets.get(&key) {
            if existing.is_exit && !target.is_exit {
                return Ok(false);
            }
            if !target.differs_from(existing) {
                return Ok(false);
            }
        }
        inner.targets.insert(key, target.clone());
        Ok(true)
    }

    async fn holdings(&self, portfolio_id: &str) -> Result<Vec<Holding>> {
        Ok(self
            .lock()
            .holdings
            .values()
            .filter(|h| h.portfolio_id == portfolio_id)
            .cloned()
            .collect())
    }

    async fn holding(&self, portfolio_id: &str, symbol: &str) -> Result<Option<Holding>> {
        let key = (portfolio_id.to_string(), symbol.to_string());
        Ok(self.lock().holdings.get(&key).cloned())
    }

    async fn latest_portfolio_state(&self, portfolio_id: &str) -> Result<Option<PortfolioState>> {
        Ok(self.lock().latest_state(portfolio_id).cloned())
    }

    async fn portfolio_state_before(
        &self,
        portfolio_id: &str,
        date: NaiveDate,
    ) -> Result<Option<PortfolioState>> {
        Ok(self
            .lock()
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.portfolio_id == portfolio_id && s.date < date)
            .max_by_key(|(i, s)| (s.date, *i))
            .map(|(_, s)| s.clone()))
    }

    async fn position_states(&self, portfolio_id: &str) -> Result<Vec<PositionState>> {
        Ok(self
            .lock()
            .positions
            .values()
            .filter(|p| p.portfolio_id == portfolio_id)
            .cloned()
            .collect())
    }

    async fn position_state(
        &self,
        portfolio_id: &str,
        symbol: &str,
    ) -> Result<Option<PositionState>> {
        let key = (portfolio_id.to_string(), symbol.to_string());
        Ok(self.lock().positions.get(&key).cloned())
    }

    async fn save_position_state(&self, state: &PositionState) -> Result<()> {
        let key = (state.portfolio_id.clone(), state.symbol.clone());
        self.lock().positions.insert(key, state.clone());
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> Result<bool> {
        let mut inner = self.lock();
        let duplicate = inner.orders.contains_key(&order.order_id)
            || inner.orders.values().any(|o| {
                o.portfolio_id == order.portfolio_id
                    && o.symbol == order.symbol
                    && o.date == order.date
            });
        if duplicate {
            return Ok(false);
        }
        inner.orders.insert(order.order_id.clone(), order.clone());
        Ok(true)
    }

    async fn order(&self, order_id: &str) -> Result<Option<Order>> {
        Ok(self.lock().orders.get(order_id).cloned())
    }

    async fn transition_order(
        &self,
        order_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.orders.get_mut(order_id) {
            Some(order) if from.contains(&order.status) => {
                order.status = to;
                if let Some(reason) = reason {
                    order.rejection_reason = Some(reason.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_broker_order(&self, order_id: &str, broker_order_id: &str) -> Result<()> {
        if let Some(order) = self.lock().orders.get_mut(order_id) {
            order.broker_order_id = Some(broker_order_id.to_string());
        }
        Ok(())
    }

    async fn update_order_qty(&self, order_id: &str, qty: f64) -> Result<()> {
        if let Some(order) = self.lock().orders.get_mut(order_id) {
            order.qty = qty;
        }
        Ok(())
    }

    async fn orders_with_status(
        &self,
        portfolio_id: &str,
        statuses: &[OrderStatus],
    ) -> Result<Vec<Order>> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| o.portfolio_id == portfolio_id && statuses.contains(&o.status))
            .cloned()
            .collect())
    }

    async fn cancel_open_orders(&self, portfolio_id: &str, reason: &str) -> Result<Vec<Order>> {
        let failing = self
            .cancel_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PipelineError::Timeout("cancel_open_orders".to_string()));
        }
        let mut inner = self.lock();
        let mut canceled = Vec::new();
        for order in inner.orders.values_mut() {
            if order.portfolio_id == portfolio_id
                && OrderStatus::PENDING_LIKE.contains(&order.status)
            {
                order.status = OrderStatus::Canceled;
                order.rejection_reason = Some(reason.to_string());
                canceled.push(order.clone());
            }
        }
        Ok(canceled)
    }

    async fn insert_fill(&self, fill: &Fill) -> Result<bool> {
        let mut inner = self.lock();
        if inner.fills.contains_key(&fill.fill_id) {
            return Ok(false);
        }
        inner.fills.insert(fill.fill_id.clone(), fill.clone());
        Ok(true)
    }

    async fn fill(&self, fill_id: &str) -> Result<Option<Fill>> {
        Ok(self.lock().fills.get(fill_id).cloned())
    }

    async fn is_fill_processed(&self, fill_id: &str) -> Result<bool> {
        Ok(self.lock().processed_fills.contains(fill_id))
    }

    async fn commit_ledger(&self, commit: &LedgerCommit) -> Result<bool> {
        let mut inner = self.lock();
        if inner.processed_fills.contains(&commit.fill_id) {
            return Ok(false);
        }
        if inner.latest_state(&commit.portfolio_id) != commit.based_on.as_ref() {
            return Err(PipelineError::Conflict(format!(
                "portfolio {} changed before fill {} was committed",
                commit.portfolio_id, commit.fill_id
            )));
        }
        inner.processed_fills.insert(commit.fill_id.clone());

        for holding in &commit.holdings {
            inner.holdings.insert(
                (holding.portfolio_id.clone(), holding.symbol.clone()),
                holding.clone(),
            );
        }
        if let Some(symbol) = &commit.closed_symbol {
            inner
                .holdings
                .remove(&(commit.portfolio_id.clone(), symbol.clone()));
        }
        inner.positions.insert(
            (
                commit.position.portfolio_id.clone(),
                commit.position.symbol.clone(),
            ),
            commit.position.clone(),
        );
        inner.states.push(commit.state.clone());
        Ok(true)
    }

    async fn load_param_overrides(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .lock()
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_param_override(&self, key: &str, value: &str) -> Result<()> {
        self.lock().params.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl FetchDailyBars for MemoryStore {
    async fn daily_bars(&self, symbol: &str, end: NaiveDate, limit: usize) -> Result<Vec<Bar>> {
        let inner = self.lock();
        let Some(series) = inner.bars.get(symbol) else {
            return Ok(Vec::new());
        };
        let mut bars: Vec<Bar> = series
            .range(..=end)
            .rev()
            .take(limit)
            .map(|(_, bar)| bar.clone())
            .collect();
        bars.reverse();
        Ok(bars)
    }

    async fn latest_close(&self, symbol: &str, on_or_before: NaiveDate) -> Result<Option<f64>> {
        Ok(self
            .lock()
            .bars
            .get(symbol)
            .and_then(|series| series.range(..=on_or_before).next_back())
            .map(|(_, bar)| bar.close))
    }
}

#[async_trait]
impl FetchFundamentals for MemoryStore {
    async fn fundamentals(&self, symbols: &[String]) -> Result<HashMap<String, Fundamentals>> {
        let inner = self.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| inner.fundamentals.get(s).map(|f| (s.clone(), f.clone())))
            .collect())
    }

    async fn instruments(&self, symbols: &[String]) -> Result<HashMap<String, Instrument>> {
        let inner = self.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| inner.instruments.get(s).map(|i| (s.clone(), i.clone())))
            .collect())
    }
}

#[async_trait]
impl FetchMarketContext for MemoryStore {
    async fn market_context(&self, date: NaiveDate) -> Result<Option<MarketContext>> {
        Ok(self
            .lock()
            .contexts
            .range(..=date)
            .next_back()
            .map(|(_, ctx)| ctx.clone()))
    }
}
