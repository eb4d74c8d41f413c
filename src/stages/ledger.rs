//! Fill accounting: holdings, position state and portfolio valuation.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{Outcome, Stage, StageContext, StageHandler};
use crate::events::{FillEvent, PortfolioEvent, StreamEntry, PORTFOLIO_STREAM};
use crate::indicators::atr_or_approximation;
use crate::models::{Fill, Holding, KillSwitchSource, PortfolioState, PositionState};
use crate::position::QTY_EPSILON;
use crate::risk::TradingState;
use crate::store::LedgerCommit;
use crate::telemetry::{Alert, AlertLevel};
use crate::Result;

/// Result of applying one signed trade to a holding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeResult {
    pub qty: f64,
    pub cost_basis: f64,
    pub realized_pnl: f64,
}

/// Apply a signed trade of `signed_qty` at `price` to a holding of
/// `qty` with average cost `cost_basis`.
///
/// Increasing trades blend the cost basis, reducing trades realize P&L
/// against it and keep it, a flip restarts it at the trade price.
pub fn apply_trade(qty: f64, cost_basis: f64, signed_qty: f64, price: f64) -> TradeResult {
    let new_qty = qty + signed_qty;

    if qty.abs() < QTY_EPSILON || qty.signum() == signed_qty.signum() {
        let cost = (qty.abs() * cost_basis + signed_qty.abs() * price) / new_qty.abs();
        return TradeResult {
            qty: new_qty,
            cost_basis: cost,
            realized_pnl: 0.0,
        };
    }

    let closed = signed_qty.abs().min(qty.abs());
    let realized_pnl = closed * (price - cost_basis) * qty.signum();

    let cost_basis = if new_qty.abs() < QTY_EPSILON {
        0.0
    } else if new_qty.signum() != qty.signum() {
        price
    } else {
        cost_basis
    };

    TradeResult {
        qty: if new_qty.abs() < QTY_EPSILON { 0.0 } else { new_qty },
        cost_basis,
        realized_pnl,
    }
}

/// Revalue holdings and roll the portfolio state forward.
pub fn revalue(
    previous: &PortfolioState,
    holdings: &mut [Holding],
    prices: &HashMap<String, f64>,
    cash: f64,
    realized_pnl: f64,
    date: chrono::NaiveDate,
) -> PortfolioState {
    let mut market_value = 0.0;
    let mut gross = 0.0;
    let mut unrealized = 0.0;
    for holding in holdings.iter_mut() {
        let price = prices
            .get(&holding.symbol)
            .copied()
            .unwrap_or(holding.cost_basis);
        holding.market_value = holding.qty * price;
        holding.date = date;
        market_value += holding.market_value;
        gross += holding.market_value.abs();
        unrealized += (price - holding.cost_basis) * holding.qty;
    }

    let nav = cash + market_value;
    let high_water_mark = previous.high_water_mark.max(nav);
    let drawdown = if high_water_mark > 0.0 {
        ((high_water_mark - nav) / high_water_mark).max(0.0)
    } else {
        0.0
    };
    let (gross_exposure, net_exposure) = if nav > 0.0 {
        (gross / nav, market_value / nav)
    } else {
        (0.0, 0.0)
    };

    PortfolioState {
        portfolio_id: previous.portfolio_id.clone(),
        date,
        nav,
        cash,
        gross_exposure,
        net_exposure,
        realized_pnl,
        unrealized_pnl: unrealized,
        drawdown,
        high_water_mark,
    }
}

pub struct LedgerAccountant {
    ctx: StageContext,
}

impl LedgerAccountant {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub async fn apply(&self, fill_id: &str) -> Result<Outcome> {
        let ctx = &self.ctx;
        if ctx.store.is_fill_processed(fill_id).await? {
            tracing::debug!(fill_id = %fill_id, "Fill already applied");
            self.recheck_breakers().await?;
            return Ok(Outcome::skipped("fill already processed"));
        }
        let Some(fill) = ctx.store.fill(fill_id).await? else {
            tracing::warn!(fill_id = %fill_id, "Unknown fill, dropping event");
            return Ok(Outcome::skipped("unknown fill"));
        };
        let Some(order) = ctx.store.order(&fill.order_id).await? else {
            tracing::warn!(fill_id = %fill_id, order_id = %fill.order_id, "Fill has no order");
            return Ok(Outcome::skipped("unknown order"));
        };
        let portfolio_id = order.portfolio_id;
        if portfolio_id != ctx.portfolio_id {
            return Ok(Outcome::skipped(format!("fill for portfolio {}", portfolio_id)));
        }

        // Everything below is computed from this state; the commit is
        // refused if another fill lands first.
        let based_on = ctx.store.latest_portfolio_state(&portfolio_id).await?;
        let previous = based_on
            .clone()
            .unwrap_or_else(|| PortfolioState::initial(&portfolio_id, fill.date, ctx.initial_capital));
        let date = previous.date.max(fill.date);

        let mut holdings = ctx.store.holdings(&portfolio_id).await?;
        let existing = holdings.iter().position(|h| h.symbol == fill.symbol);
        let (held_qty, held_cost) = existing
            .map(|i| (holdings[i].qty, holdings[i].cost_basis))
            .unwrap_or((0.0, 0.0));

        let signed_qty = fill.side.sign() * fill.qty;
        let trade = apply_trade(held_qty, held_cost, signed_qty, fill.price);
        let closed = trade.qty.abs() < QTY_EPSILON;

        match (existing, closed) {
            (Some(i), true) => {
                holdings.remove(i);
            }
            (Some(i), false) => {
                holdings[i].qty = trade.qty;
                holdings[i].cost_basis = trade.cost_basis;
            }
            (None, false) => holdings.push(Holding {
                portfolio_id: portfolio_id.clone(),
                date,
                symbol: fill.symbol.clone(),
                qty: trade.qty,
                cost_basis: trade.cost_basis,
                market_value: 0.0,
            }),
            (None, true) => {}
        }

        let mut prices = HashMap::with_capacity(holdings.len());
        for holding in &holdings {
            let price = ctx.market.latest_close(&holding.symbol, date).await?;
            match price.filter(|p| *p > 0.0) {
                Some(price) => {
                    prices.insert(holding.symbol.clone(), price);
                }
                None if holding.symbol != fill.symbol => {
                    tracing::warn!(symbol = %holding.symbol, "No price, valuing at cost basis");
                    alert_missing_price(ctx, &holding.symbol).await;
                }
                None => {}
            }
        }
        prices.entry(fill.symbol.clone()).or_insert(fill.price);

        let cash = previous.cash - signed_qty * fill.price - fill.commission;
        let realized = previous.realized_pnl + trade.realized_pnl;
        let state = revalue(&previous, &mut holdings, &prices, cash, realized, date);

        let position = self.next_position(&fill, trade.qty).await?;

        let commit = LedgerCommit {
            fill_id: fill.fill_id.clone(),
            portfolio_id: portfolio_id.clone(),
            holdings,
            closed_symbol: closed.then(|| fill.symbol.clone()),
            position,
            state: state.clone(),
            based_on,
        };
        if !ctx.store.commit_ledger(&commit).await? {
            tracing::debug!(fill_id = %fill.fill_id, "Fill applied concurrently");
            self.recheck_breakers().await?;
            return Ok(Outcome::skipped("fill already processed"));
        }
        tracing::debug!(fill_id = %fill.fill_id, "Ledger committed");

        ctx.publish(PORTFOLIO_STREAM, &PortfolioEvent::from(&state))
            .await?;
        tracing::info!(
            "💼 {} NAV ${:.2} cash ${:.2} gross {:.1}% drawdown {:.2}%",
            portfolio_id,
            state.nav,
            state.cash,
            state.gross_exposure * 100.0,
            state.drawdown * 100.0
        );

        self.check_breakers(&state).await?;
        Ok(Outcome::Done)
    }

    /// Trip the kill switch if `state` breaches a circuit breaker.
    async fn check_breakers(&self, state: &PortfolioState) -> Result<()> {
        let ctx = &self.ctx;
        let before = ctx
            .store
            .portfolio_state_before(&state.portfolio_id, state.date)
            .await?;
        let trading = TradingState::from_portfolio(state, before.as_ref());
        if let Err(trip) = ctx.params.snapshot().breakers.check(&trading) {
            let reason = trip.describe();
            tracing::error!("🚨 Circuit breaker tripped for {}: {}", state.portfolio_id, reason);
            ctx.count("circuit_breaker_trips", Stage::Ledger, "tripped").await;
            ctx.kill_switch
                .activate(&reason, KillSwitchSource::Auto)
                .await?;
        }
        Ok(())
    }

    /// A redelivered fill may be one whose breaker check never finished.
    async fn recheck_breakers(&self) -> Result<()> {
        match self.ctx.store.latest_portfolio_state(&self.ctx.portfolio_id).await? {
            Some(state) => self.check_breakers(&state).await,
            None => Ok(()),
        }
    }

    async fn next_position(&self, fill: &Fill, new_qty: f64) -> Result<PositionState> {
        let ctx = &self.ctx;
        let mut position = ctx
            .store
            .position_state(&ctx.portfolio_id, &fill.symbol)
            .await?
            .unwrap_or_else(|| PositionState::flat(&ctx.portfolio_id, &fill.symbol));

        let period = ctx.params.snapshot().exit.atr_period;
        let bars = ctx
            .market
            .daily_bars(&fill.symbol, fill.date, period + 1)
            .await?;
        position.apply_fill(new_qty, fill.price, fill.date, atr_or_approximation(&bars, period));
        Ok(position)
    }
}

#[async_trait]
impl StageHandler for LedgerAccountant {
    fn name(&self) -> &str {
        Stage::Ledger.name()
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<Outcome> {
        let FillEvent::FillCreated { fill_id, .. } = entry.decode()?;
        self.apply(&fill_id).await
    }
}

async fn alert_missing_price(ctx: &StageContext, symbol: &str) {
    ctx.telemetry
        .alert(Alert::new(
            AlertLevel::Warning,
            Stage::Ledger.name(),
            &ctx.portfolio_id,
            format!("{} valued at cost basis, no price", symbol),
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyParams;
    use crate::models::{Direction, Order, OrderSide, OrderStatus, OrderType};
    use crate::data::{FetchDailyBars, FetchFundamentals, FetchMarketContext};
    use crate::error::PipelineError;
    use crate::models::{Bar, Fundamentals, Instrument, MarketContext};
    use crate::stages::testing::{bars, harness, Harness};
    use crate::store::{MemoryStore, TradingStore};
    use chrono::NaiveDate;
    use std::sync::Arc;

    /// Market data that yields once per price lookup, letting two
    /// concurrent applies interleave between their reads and commits.
    struct YieldingMarket(Arc<MemoryStore>);

    #[async_trait]
    impl FetchDailyBars for YieldingMarket {
        async fn daily_bars(&self, symbol: &str, end: NaiveDate, limit: usize) -> Result<Vec<Bar>> {
            self.0.daily_bars(symbol, end, limit).await
        }

        async fn latest_close(&self, symbol: &str, on_or_before: NaiveDate) -> Result<Option<f64>> {
            tokio::task::yield_now().await;
            self.0.latest_close(symbol, on_or_before).await
        }
    }

    #[async_trait]
    impl FetchFundamentals for YieldingMarket {
        async fn fundamentals(&self, symbols: &[String]) -> Result<HashMap<String, Fundamentals>> {
            self.0.fundamentals(symbols).await
        }

        async fn instruments(&self, symbols: &[String]) -> Result<HashMap<String, Instrument>> {
            self.0.instruments(symbols).await
        }
    }

    #[async_trait]
    impl FetchMarketContext for YieldingMarket {
        async fn market_context(&self, date: NaiveDate) -> Result<Option<MarketContext>> {
            self.0.market_context(date).await
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
    }

    async fn book(h: &Harness, id: &str, date: NaiveDate, side: OrderSide, qty: f64, price: f64) {
        let order = Order {
            order_id: format!("order-{}", id),
            portfolio_id: "main".to_string(),
            date,
            symbol: "SPY".to_string(),
            side,
            qty,
            order_type: OrderType::MarketOnOpen,
            status: OrderStatus::Filled,
            broker_order_id: Some(id.to_string()),
            rejection_reason: None,
        };
        h.store.insert_order(&order).await.unwrap();
        h.store
            .insert_fill(&Fill {
                fill_id: Fill::id_for_broker_order(id),
                order_id: order.order_id,
                date,
                symbol: "SPY".to_string(),
                side,
                qty,
                price,
                commission: 0.0,
                is_estimated: false,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_cost_basis_rules() {
        let added = apply_trade(10.0, 100.0, 10.0, 110.0);
        assert_eq!(added.qty, 20.0);
        assert!((added.cost_basis - 105.0).abs() < 1e-9);

        let reduced = apply_trade(20.0, 105.0, -5.0, 120.0);
        assert_eq!(reduced.qty, 15.0);
        assert_eq!(reduced.cost_basis, 105.0);
        assert!((reduced.realized_pnl - 75.0).abs() < 1e-9);

        let flipped = apply_trade(10.0, 100.0, -15.0, 90.0);
        assert_eq!(flipped.qty, -5.0);
        assert_eq!(flipped.cost_basis, 90.0);
        assert!((flipped.realized_pnl + 100.0).abs() < 1e-9);

        let closed = apply_trade(10.0, 100.0, -10.0, 100.0);
        assert_eq!(closed.qty, 0.0);
        assert_eq!(closed.cost_basis, 0.0);
    }

    #[tokio::test]
    async fn test_buy_updates_holding_cash_and_nav() {
        let h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", day(2), &[500.0; 20]));
        book(&h, "b-1", day(2), OrderSide::Buy, 20.0, 500.0).await;

        let ledger = LedgerAccountant::new(h.ctx.clone());
        assert_eq!(ledger.apply("fill-b-1").await.unwrap(), Outcome::Done);

        let holding = h.store.holding("main", "SPY").await.unwrap().unwrap();
        assert_eq!(holding.qty, 20.0);
        assert_eq!(holding.cost_basis, 500.0);

        let state = h.store.latest_portfolio_state("main").await.unwrap().unwrap();
        assert_eq!(state.cash, 90_000.0);
        assert_eq!(state.nav, 100_000.0);
        assert!((state.gross_exposure - 0.10).abs() < 1e-9);

        let position = h.store.position_state("main", "SPY").await.unwrap().unwrap();
        assert_eq!(position.direction, Direction::Long);
        assert_eq!(position.entry_price, Some(500.0));
        assert_eq!(position.entry_atr, Some(2.0));

        assert_eq!(h.stream.entries_of(PORTFOLIO_STREAM, "state_update").len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_fill_applied_once() {
        let h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", day(2), &[500.0; 20]));
        book(&h, "b-1", day(2), OrderSide::Buy, 20.0, 500.0).await;

        let ledger = LedgerAccountant::new(h.ctx.clone());
        ledger.apply("fill-b-1").await.unwrap();
        let second = ledger.apply("fill-b-1").await.unwrap();

        assert_eq!(second, Outcome::skipped("fill already processed"));
        assert_eq!(h.store.holding("main", "SPY").await.unwrap().unwrap().qty, 20.0);
        assert_eq!(h.store.portfolio_states("main").len(), 1);
    }

    #[tokio::test]
    async fn test_closing_sell_removes_holding_and_realizes() {
        let h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", day(3), &[550.0; 20]));
        book(&h, "b-1", day(2), OrderSide::Buy, 20.0, 500.0).await;
        book(&h, "s-1", day(3), OrderSide::Sell, 20.0, 550.0).await;

        let ledger = LedgerAccountant::new(h.ctx.clone());
        ledger.apply("fill-b-1").await.unwrap();
        ledger.apply("fill-s-1").await.unwrap();

        assert!(h.store.holding("main", "SPY").await.unwrap().is_none());
        let state = h.store.latest_portfolio_state("main").await.unwrap().unwrap();
        assert_eq!(state.realized_pnl, 1_000.0);
        assert_eq!(state.nav, 101_000.0);
        assert_eq!(state.gross_exposure, 0.0);

        let position = h.store.position_state("main", "SPY").await.unwrap().unwrap();
        assert_eq!(position.direction, Direction::Flat);
    }

    #[tokio::test]
    async fn test_daily_loss_trips_kill_switch() {
        let h = harness(StrategyParams::default());
        h.store.insert_portfolio_state(PortfolioState::initial("main", day(1), 100_000.0));
        h.store.insert_bars(&bars("SPY", day(2), &[400.0; 20]));
        // Bought at 500, marked at 400: a 10% NAV loss on the day.
        book(&h, "b-1", day(2), OrderSide::Buy, 100.0, 500.0).await;

        LedgerAccountant::new(h.ctx.clone())
            .apply("fill-b-1")
            .await
            .unwrap();

        let switch = h.ctx.kill_switch.state().await.unwrap();
        assert!(switch.active);
        assert_eq!(switch.source, Some(KillSwitchSource::Auto));
        assert!(h
            .telemetry
            .alerts()
            .iter()
            .any(|a| a.level == AlertLevel::Critical));
    }

    #[tokio::test]
    async fn test_breaker_rechecked_when_fill_redelivered() {
        let h = harness(StrategyParams::default());
        h.store.insert_portfolio_state(PortfolioState::initial("main", day(1), 100_000.0));
        h.store.insert_bars(&bars("SPY", day(2), &[400.0; 20]));
        book(&h, "b-1", day(2), OrderSide::Buy, 100.0, 500.0).await;
        let open = Order {
            order_id: "order-q".to_string(),
            symbol: "QQQ".to_string(),
            status: OrderStatus::New,
            broker_order_id: None,
            ..h.store.order("order-b-1").await.unwrap().unwrap()
        };
        h.store.insert_order(&open).await.unwrap();

        // The ledger commits, then the kill switch fails to cancel orders.
        h.store.fail_next_cancels(1);
        let ledger = LedgerAccountant::new(h.ctx.clone());
        assert!(ledger.apply("fill-b-1").await.is_err());
        assert!(h.store.is_fill_processed("fill-b-1").await.unwrap());
        assert_eq!(h.store.order("order-q").await.unwrap().unwrap().status, OrderStatus::New);

        let retry = ledger.apply("fill-b-1").await.unwrap();

        assert_eq!(retry, Outcome::skipped("fill already processed"));
        assert!(h.ctx.kill_switch.is_active().await.unwrap());
        assert_eq!(
            h.store.order("order-q").await.unwrap().unwrap().status,
            OrderStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_concurrent_fills_are_serialized() {
        let mut h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", day(2), &[500.0; 20]));
        h.ctx.market = Arc::new(YieldingMarket(h.store.clone()));
        book(&h, "b-1", day(2), OrderSide::Buy, 20.0, 500.0).await;
        book(&h, "b-2", day(3), OrderSide::Buy, 10.0, 500.0).await;

        let ledger = LedgerAccountant::new(h.ctx.clone());
        let (first, second) = tokio::join!(ledger.apply("fill-b-1"), ledger.apply("fill-b-2"));

        // Both read the empty ledger; whichever commits second is refused.
        let retry = match (first, second) {
            (Ok(Outcome::Done), Err(e)) => {
                assert!(matches!(e, PipelineError::Conflict(_)));
                "fill-b-2"
            }
            (Err(e), Ok(Outcome::Done)) => {
                assert!(matches!(e, PipelineError::Conflict(_)));
                "fill-b-1"
            }
            other => panic!("expected one conflict, got {:?}", other),
        };
        assert_eq!(ledger.apply(retry).await.unwrap(), Outcome::Done);

        let holding = h.store.holding("main", "SPY").await.unwrap().unwrap();
        assert_eq!(holding.qty, 30.0);
        let state = h.store.latest_portfolio_state("main").await.unwrap().unwrap();
        assert_eq!(state.cash, 85_000.0);
        assert_eq!(h.store.portfolio_states("main").len(), 2);
    }
}
