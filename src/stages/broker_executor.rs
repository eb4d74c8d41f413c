//! Order submission and fill capture.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{Outcome, Stage, StageContext, StageHandler};
use crate::broker::{Broker, BrokerOrder, BrokerOrderRequest, TimeInForce};
use crate::config::params::ExecutionParams;
use crate::events::{FillEvent, OrderEvent, StreamEntry, FILLS_STREAM, ORDERS_STREAM};
use crate::models::{Fill, Order, OrderSide, OrderStatus, OrderType};
use crate::position::QTY_EPSILON;
use crate::Result;

/// What to do with a SELL given the broker's reported position.
#[derive(Debug, Clone, PartialEq)]
pub enum SellDecision {
    AsOrdered,
    Capped { qty: f64 },
    Reject { reason: String },
}

/// Validate a sell of `qty` against `held` shares at the broker.
///
/// Without short selling the order is capped to the long position. With
/// it, only whole shares beyond the position may open a short.
pub fn check_sell(qty: f64, held: f64, allow_short_selling: bool) -> SellDecision {
    let held = held.max(0.0);
    if qty <= held + QTY_EPSILON {
        return SellDecision::AsOrdered;
    }

    if allow_short_selling {
        let short = (qty - held).trunc();
        let allowed = held + short;
        if allowed <= QTY_EPSILON {
            return SellDecision::Reject {
                reason: format!("fractional short quantity {:.4} not allowed", qty - held),
            };
        }
        if (allowed - qty).abs() <= QTY_EPSILON {
            return SellDecision::AsOrdered;
        }
        return SellDecision::Capped { qty: allowed };
    }

    if held <= QTY_EPSILON {
        SellDecision::Reject {
            reason: "no position to sell".to_string(),
        }
    } else {
        SellDecision::Capped { qty: held }
    }
}

fn time_in_force(order_type: OrderType) -> TimeInForce {
    match order_type {
        OrderType::MarketOnOpen => TimeInForce::Opg,
        OrderType::Market => TimeInForce::Day,
    }
}

enum Submission {
    Placed(BrokerOrder),
    Stopped(Outcome),
}

enum FillWait {
    Filled(BrokerOrder),
    Dead(BrokerOrder),
    TimedOut(BrokerOrder),
}

pub struct BrokerExecutor {
    ctx: StageContext,
    broker: Arc<dyn Broker>,
}

impl BrokerExecutor {
    pub fn new(ctx: StageContext, broker: Arc<dyn Broker>) -> Self {
        Self { ctx, broker }
    }

    pub async fn execute(&self, order_id: &str) -> Result<Outcome> {
        let ctx = &self.ctx;
        let Some(mut order) = ctx.store.order(order_id).await? else {
            tracing::warn!(order_id = %order_id, "Unknown order, dropping event");
            return Ok(Outcome::skipped("unknown order"));
        };
        if order.portfolio_id != ctx.portfolio_id {
            return Ok(Outcome::skipped(format!("order for portfolio {}", order.portfolio_id)));
        }
        if ctx.kill_switch.is_active().await? {
            tracing::info!(order_id = %order.order_id, "Kill switch active, order not submitted");
            ctx.count("orders_blocked", Stage::Executor, "kill_switch").await;
            return Ok(Outcome::skipped("kill switch active"));
        }

        // PENDING_EXECUTION is re-entered on retries and redeliveries; the
        // client order id keeps the broker side idempotent.
        let claimed = ctx
            .store
            .transition_order(
                &order.order_id,
                &[OrderStatus::New, OrderStatus::PendingExecution],
                OrderStatus::PendingExecution,
                None,
            )
            .await?;
        if !claimed {
            let current = ctx.store.order(order_id).await?.unwrap_or(order);
            return self.redrive(&current).await;
        }

        let params = ctx.params.snapshot();
        let exec = &params.execution;

        // A retried order may already be at the broker; resume from there
        // rather than re-validating against a position it already changed.
        let resumed = if order.status == OrderStatus::PendingExecution {
            self.broker.get_order_by_client_id(&order.order_id).await?
        } else {
            None
        };
        let submitted = match resumed {
            Some(existing) => {
                tracing::debug!(
                    order_id = %order.order_id,
                    broker_order_id = %existing.id,
                    "Resuming order already at the broker"
                );
                existing
            }
            None => match self.submit(&mut order, exec).await? {
                Submission::Placed(placed) => placed,
                Submission::Stopped(outcome) => return Ok(outcome),
            },
        };
        ctx.store
            .record_broker_order(&order.order_id, &submitted.id)
            .await?;

        if submitted.is_filled() {
            self.record_fill(&order, &submitted, false).await?;
            return Ok(Outcome::Done);
        }

        let next = match order.order_type {
            OrderType::MarketOnOpen => OrderStatus::Accepted,
            OrderType::Market => OrderStatus::Submitted,
        };
        let advanced = ctx
            .store
            .transition_order(&order.order_id, &[OrderStatus::PendingExecution], next, None)
            .await?;
        if !advanced {
            // Canceled (kill switch) or advanced by another worker meanwhile.
            let current = ctx.store.order(&order.order_id).await?.unwrap_or(order);
            if current.status == OrderStatus::Canceled {
                tracing::warn!(
                    order_id = %current.order_id,
                    broker_order_id = %submitted.id,
                    "Order canceled during submission, canceling at broker"
                );
                return self.reconcile_canceled(&current, &submitted.id).await;
            }
            return Ok(Outcome::skipped(format!("order already {}", current.status.as_str())));
        }

        if order.order_type == OrderType::MarketOnOpen {
            tracing::info!(
                order_id = %order.order_id,
                broker_order_id = %submitted.id,
                "📤 {} {} {} queued for the open",
                order.side.as_str(),
                order.qty,
                order.symbol
            );
            ctx.count("orders_submitted", Stage::Executor, "accepted").await;
            return Ok(Outcome::Done);
        }
        ctx.count("orders_submitted", Stage::Executor, "submitted").await;

        match self.wait_for_fill(submitted, exec).await? {
            FillWait::Filled(filled) => {
                self.record_fill(&order, &filled, false).await?;
                Ok(Outcome::Done)
            }
            FillWait::Dead(dead) => {
                let reason = format!("broker order {} ended {:?}", dead.id, dead.status);
                self.terminate(&order, OrderStatus::Canceled, &reason).await
            }
            FillWait::TimedOut(pending) => {
                let Some(price) = self.broker.latest_trade_price(&order.symbol).await? else {
                    tracing::warn!(
                        order_id = %order.order_id,
                        "Fill wait timed out with no trade price, left for fill sync"
                    );
                    return Ok(Outcome::deferred("fill pending"));
                };
                tracing::warn!(
                    order_id = %order.order_id,
                    "⚠️ Fill wait timed out, booking estimated fill at ${:.2}",
                    price
                );
                let estimated = BrokerOrder {
                    filled_qty: order.qty,
                    filled_avg_price: Some(price),
                    ..pending
                };
                self.record_fill(&order, &estimated, true).await?;
                Ok(Outcome::Done)
            }
        }
    }

    /// Pre-submit checks and the submission itself.
    async fn submit(&self, order: &mut Order, exec: &ExecutionParams) -> Result<Submission> {
        let ctx = &self.ctx;
        if order.side == OrderSide::Sell {
            let held = self
                .broker
                .get_open_position(&order.symbol)
                .await?
                .map(|p| p.qty)
                .unwrap_or(0.0);
            match check_sell(order.qty, held, exec.allow_short_selling) {
                SellDecision::AsOrdered => {}
                SellDecision::Capped { qty } => {
                    tracing::warn!(
                        order_id = %order.order_id,
                        "Capping sell of {} {} to available {}",
                        order.qty,
                        order.symbol,
                        qty
                    );
                    ctx.store.update_order_qty(&order.order_id, qty).await?;
                    order.qty = qty;
                }
                SellDecision::Reject { reason } => {
                    let outcome = self.terminate(order, OrderStatus::Rejected, &reason).await?;
                    return Ok(Submission::Stopped(outcome));
                }
            }
        }

        if order.order_type == OrderType::Market && !self.broker.get_clock().await?.is_open {
            tracing::info!(order_id = %order.order_id, "Market closed, order left pending");
            return Ok(Submission::Stopped(Outcome::deferred("market closed")));
        }

        // The switch may have flipped since the first check.
        if ctx.kill_switch.is_active().await? {
            ctx.store
                .transition_order(
                    &order.order_id,
                    &[OrderStatus::PendingExecution],
                    OrderStatus::Canceled,
                    Some("kill switch active"),
                )
                .await?;
            tracing::info!(order_id = %order.order_id, "Kill switch activated before submission");
            ctx.count("orders_blocked", Stage::Executor, "kill_switch").await;
            return Ok(Submission::Stopped(Outcome::skipped("kill switch active")));
        }

        let request = BrokerOrderRequest {
            client_order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            time_in_force: time_in_force(order.order_type),
        };
        match self.broker.submit_order(&request).await {
            Ok(placed) => Ok(Submission::Placed(placed)),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => match self.broker.get_order_by_client_id(&order.order_id).await? {
                Some(existing) => {
                    tracing::debug!(
                        order_id = %order.order_id,
                        broker_order_id = %existing.id,
                        "Order was already submitted"
                    );
                    Ok(Submission::Placed(existing))
                }
                None => {
                    let outcome = self
                        .terminate(order, OrderStatus::Failed, &e.to_string())
                        .await?;
                    Ok(Submission::Stopped(outcome))
                }
            },
        }
    }

    async fn wait_for_fill(&self, mut current: BrokerOrder, exec: &ExecutionParams) -> Result<FillWait> {
        let deadline = Instant::now() + Duration::from_secs(exec.fill_timeout_secs);
        let poll = Duration::from_millis(exec.fill_poll_ms.max(1));
        loop {
            if current.is_filled() {
                return Ok(FillWait::Filled(current));
            }
            if current.status.is_dead() {
                return Ok(FillWait::Dead(current));
            }
            if Instant::now() >= deadline {
                return Ok(FillWait::TimedOut(current));
            }
            tokio::time::sleep(poll).await;
            current = self.broker.get_order(&current.id).await?;
        }
    }

    /// Insert the fill (idempotent on the broker order id), publish it, and
    /// only then mark the order FILLED. Until the last step succeeds the
    /// order stays in a state that redelivery or fill sync re-drives; a
    /// repeated publish is absorbed by the ledger's processed-fill set.
    async fn record_fill(&self, order: &Order, broker_order: &BrokerOrder, estimated: bool) -> Result<()> {
        let ctx = &self.ctx;
        let price = broker_order.filled_avg_price.unwrap_or_default();
        let qty = if broker_order.filled_qty > QTY_EPSILON {
            broker_order.filled_qty
        } else {
            order.qty
        };
        let fill = Fill {
            fill_id: Fill::id_for_broker_order(&broker_order.id),
            order_id: order.order_id.clone(),
            date: order.date,
            symbol: order.symbol.clone(),
            side: order.side,
            qty,
            price,
            commission: 0.0,
            is_estimated: estimated,
        };

        let fill = if ctx.store.insert_fill(&fill).await? {
            fill
        } else {
            tracing::debug!(fill_id = %fill.fill_id, "Fill already recorded, republishing");
            ctx.store.fill(&fill.fill_id).await?.unwrap_or(fill)
        };
        ctx.publish(FILLS_STREAM, &FillEvent::from(&fill)).await?;

        // A broker fill wins over a local cancel that raced it.
        ctx.store
            .transition_order(
                &order.order_id,
                &[
                    OrderStatus::PendingExecution,
                    OrderStatus::Submitted,
                    OrderStatus::Accepted,
                    OrderStatus::Canceled,
                ],
                OrderStatus::Filled,
                None,
            )
            .await?;

        tracing::info!(
            order_id = %order.order_id,
            fill_id = %fill.fill_id,
            "✅ Filled {} {} {} @ ${:.2}{}",
            fill.side.as_str(),
            fill.qty,
            fill.symbol,
            fill.price,
            if fill.is_estimated { " (estimated)" } else { "" }
        );
        ctx.count(
            "fills",
            Stage::Executor,
            if fill.is_estimated { "estimated" } else { "confirmed" },
        )
        .await;
        Ok(())
    }

    /// Handle an event for an order that could not be claimed: finish
    /// what an earlier attempt left behind, or skip.
    async fn redrive(&self, order: &Order) -> Result<Outcome> {
        let broker_id = order.broker_order_id.as_deref();
        match (order.status, broker_id) {
            (OrderStatus::Accepted | OrderStatus::Submitted, Some(broker_id)) => {
                if self.sync_order(order, broker_id).await? {
                    return Ok(Outcome::Done);
                }
            }
            (OrderStatus::Canceled, Some(broker_id)) => {
                return self.reconcile_canceled(order, broker_id).await;
            }
            _ => {}
        }
        tracing::debug!(
            order_id = %order.order_id,
            "Order already {}, nothing to submit",
            order.status.as_str()
        );
        Ok(Outcome::skipped(format!("order already {}", order.status.as_str())))
    }

    /// Make the broker agree with a locally canceled order: book the fill
    /// if it already executed, otherwise cancel it there.
    async fn reconcile_canceled(&self, order: &Order, broker_order_id: &str) -> Result<Outcome> {
        let broker_order = self.broker.get_order(broker_order_id).await?;
        if broker_order.is_filled() {
            tracing::warn!(
                order_id = %order.order_id,
                "Canceled order was filled at the broker, booking the fill"
            );
            self.record_fill(order, &broker_order, false).await?;
            return Ok(Outcome::Done);
        }
        if !broker_order.status.is_dead() {
            self.broker.cancel_order(broker_order_id).await?;
            tracing::info!(
                order_id = %order.order_id,
                broker_order_id = %broker_order_id,
                "Broker order canceled"
            );
        }
        Ok(Outcome::skipped("order canceled"))
    }

    async fn terminate(&self, order: &Order, status: OrderStatus, reason: &str) -> Result<Outcome> {
        self.ctx
            .store
            .transition_order(
                &order.order_id,
                &[OrderStatus::PendingExecution, OrderStatus::Submitted],
                status,
                Some(reason),
            )
            .await?;
        tracing::warn!(
            order_id = %order.order_id,
            "Order {}: {}",
            status.as_str(),
            reason
        );
        self.ctx
            .count("orders_terminal", Stage::Executor, status.as_str())
            .await;
        Ok(Outcome::rejected(reason))
    }

    /// Convert broker-filled ACCEPTED/SUBMITTED orders into fills. Returns
    /// the number of fills recorded.
    pub async fn sync_fills(&self) -> Result<usize> {
        let open = self
            .ctx
            .store
            .orders_with_status(
                &self.ctx.portfolio_id,
                &[OrderStatus::Accepted, OrderStatus::Submitted],
            )
            .await?;

        let mut filled = 0;
        for order in open {
            let Some(broker_order_id) = order.broker_order_id.as_deref() else {
                continue;
            };
            if self.sync_order(&order, broker_order_id).await? {
                filled += 1;
            }
        }

        if filled > 0 {
            tracing::info!("🔄 Fill sync recorded {} fills", filled);
        }
        Ok(filled)
    }

    /// Check one open order at the broker. Returns true when a fill was
    /// recorded.
    async fn sync_order(&self, order: &Order, broker_order_id: &str) -> Result<bool> {
        let broker_order = self.broker.get_order(broker_order_id).await?;
        if broker_order.is_filled() {
            self.record_fill(order, &broker_order, false).await?;
            return Ok(true);
        }
        if broker_order.status.is_dead() {
            let reason = format!("broker order {} ended {:?}", broker_order.id, broker_order.status);
            self.terminate_open(order, &reason).await?;
        }
        Ok(false)
    }

    async fn terminate_open(&self, order: &Order, reason: &str) -> Result<()> {
        self.ctx
            .store
            .transition_order(
                &order.order_id,
                &[OrderStatus::Accepted, OrderStatus::Submitted],
                OrderStatus::Canceled,
                Some(reason),
            )
            .await?;
        tracing::warn!(order_id = %order.order_id, "Order canceled: {}", reason);
        Ok(())
    }

    /// Republish `order_retry` for every order left PENDING_EXECUTION.
    pub async fn retry_pending(&self) -> Result<usize> {
        let pending = self
            .ctx
            .store
            .orders_with_status(&self.ctx.portfolio_id, &[OrderStatus::PendingExecution])
            .await?;
        for order in &pending {
            self.ctx
                .publish(ORDERS_STREAM, &OrderEvent::OrderRetry(order.into()))
                .await?;
        }
        if !pending.is_empty() {
            tracing::info!("Republished {} pending orders", pending.len());
        }
        Ok(pending.len())
    }
}

#[async_trait]
impl StageHandler for BrokerExecutor {
    fn name(&self) -> &str {
        Stage::Executor.name()
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<Outcome> {
        let event: OrderEvent = entry.decode()?;
        self.execute(&event.payload().order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerOrderStatus, BrokerPosition, MarketClock, PaperBroker};
    use crate::config::StrategyParams;
    use crate::models::KillSwitchSource;
    use crate::risk::KillSwitch;
    use crate::stages::testing::{harness, FlakyStream, Harness};
    use crate::store::TradingStore;
    use chrono::NaiveDate;

    #[derive(Clone, Copy, PartialEq)]
    enum Trip {
        OnClock,
        OnSubmit,
    }

    /// Paper broker that activates the kill switch part way through
    /// the executor's broker calls.
    struct TripsKillSwitch {
        inner: PaperBroker,
        switch: KillSwitch,
        at: Trip,
    }

    impl TripsKillSwitch {
        async fn trip(&self, at: Trip) {
            if self.at == at {
                self.switch
                    .activate("operator halt", KillSwitchSource::Manual)
                    .await
                    .unwrap();
            }
        }
    }

    #[async_trait]
    impl Broker for TripsKillSwitch {
        async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrder> {
            self.trip(Trip::OnSubmit).await;
            self.inner.submit_order(request).await
        }

        async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder> {
            self.inner.get_order(broker_order_id).await
        }

        async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<BrokerOrder>> {
            self.inner.get_order_by_client_id(client_order_id).await
        }

        async fn get_open_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
            self.inner.get_open_position(symbol).await
        }

        async fn get_clock(&self) -> Result<MarketClock> {
            self.trip(Trip::OnClock).await;
            self.inner.get_clock().await
        }

        async fn cancel_order(&self, broker_order_id: &str) -> Result<()> {
            self.inner.cancel_order(broker_order_id).await
        }

        async fn latest_trade_price(&self, symbol: &str) -> Result<Option<f64>> {
            self.inner.latest_trade_price(symbol).await
        }
    }

    /// Executor whose context fails the next publish to `fills`.
    fn with_fill_outage(h: &Harness, broker: &PaperBroker) -> BrokerExecutor {
        let mut ctx = h.ctx.clone();
        ctx.stream = Arc::new(FlakyStream::new(h.stream.clone(), FILLS_STREAM, 1));
        BrokerExecutor::new(ctx, Arc::new(broker.clone()))
    }

    fn order(id: &str, side: OrderSide, qty: f64, order_type: OrderType) -> Order {
        Order {
            order_id: id.to_string(),
            portfolio_id: "main".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(),
            symbol: "SPY".to_string(),
            side,
            qty,
            order_type,
            status: OrderStatus::New,
            broker_order_id: None,
            rejection_reason: None,
        }
    }

    async fn setup(params: StrategyParams, order: Order) -> (Harness, PaperBroker, BrokerExecutor) {
        let h = harness(params);
        h.store.insert_order(&order).await.unwrap();
        let broker = PaperBroker::new();
        broker.set_price("SPY", 500.0);
        let executor = BrokerExecutor::new(h.ctx.clone(), Arc::new(broker.clone()));
        (h, broker, executor)
    }

    async fn status(h: &Harness, id: &str) -> OrderStatus {
        h.store.order(id).await.unwrap().unwrap().status
    }

    #[test]
    fn test_sell_checks() {
        assert_eq!(check_sell(5.0, 10.0, false), SellDecision::AsOrdered);
        assert_eq!(check_sell(8.0, 5.0, false), SellDecision::Capped { qty: 5.0 });
        assert!(matches!(check_sell(1.0, 0.0, false), SellDecision::Reject { .. }));
        assert_eq!(check_sell(8.0, 5.0, true), SellDecision::AsOrdered);
        assert_eq!(check_sell(7.5, 5.0, true), SellDecision::Capped { qty: 7.0 });
        assert!(matches!(check_sell(0.5, 0.0, true), SellDecision::Reject { .. }));
    }

    #[tokio::test]
    async fn test_opening_order_accepted_then_synced() {
        let (h, broker, executor) =
            setup(StrategyParams::default(), order("o-1", OrderSide::Buy, 20.0, OrderType::MarketOnOpen)).await;

        assert_eq!(executor.execute("o-1").await.unwrap(), Outcome::Done);
        assert_eq!(status(&h, "o-1").await, OrderStatus::Accepted);
        assert!(h.store.fills().is_empty());

        // Redelivery does not resubmit.
        assert!(matches!(executor.execute("o-1").await.unwrap(), Outcome::Skipped(_)));
        assert_eq!(broker.submissions(), 1);

        broker.fill_open_orders();
        assert_eq!(executor.sync_fills().await.unwrap(), 1);
        assert_eq!(status(&h, "o-1").await, OrderStatus::Filled);

        let fills = h.store.fills();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 500.0);
        assert!(!fills[0].is_estimated);
        assert_eq!(h.stream.entries_of(FILLS_STREAM, "fill_created").len(), 1);

        // A second sync finds nothing new.
        assert_eq!(executor.sync_fills().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_market_order_waits_for_open_market() {
        let mut params = StrategyParams::default();
        params.execution.order_type = OrderType::Market;
        let (h, broker, executor) =
            setup(params, order("o-1", OrderSide::Buy, 2.0, OrderType::Market)).await;
        broker.set_market_open(false);

        assert_eq!(executor.execute("o-1").await.unwrap(), Outcome::deferred("market closed"));
        assert_eq!(status(&h, "o-1").await, OrderStatus::PendingExecution);

        broker.set_market_open(true);
        assert_eq!(executor.retry_pending().await.unwrap(), 1);
        let retry = &h.stream.entries_of(ORDERS_STREAM, "order_retry")[0];
        assert_eq!(executor.handle(retry).await.unwrap(), Outcome::Done);

        assert_eq!(status(&h, "o-1").await, OrderStatus::Filled);
        assert_eq!(h.store.fills().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_books_estimated_fill() {
        let mut params = StrategyParams::default();
        params.execution.fill_timeout_secs = 0;
        params.execution.fill_poll_ms = 1;
        let (h, broker, executor) =
            setup(params, order("o-1", OrderSide::Buy, 2.0, OrderType::Market)).await;
        broker.set_fill_market_orders(false);

        assert_eq!(executor.execute("o-1").await.unwrap(), Outcome::Done);

        let fills = h.store.fills();
        assert_eq!(fills.len(), 1);
        assert!(fills[0].is_estimated);
        assert_eq!(fills[0].qty, 2.0);
        assert_eq!(fills[0].price, 500.0);
    }

    #[tokio::test]
    async fn test_sell_capped_to_broker_position() {
        let (h, broker, executor) =
            setup(StrategyParams::default(), order("o-1", OrderSide::Sell, 8.0, OrderType::MarketOnOpen)).await;
        broker.set_position("SPY", 5.0);

        executor.execute("o-1").await.unwrap();

        assert_eq!(h.store.order("o-1").await.unwrap().unwrap().qty, 5.0);
        broker.fill_open_orders();
        assert_eq!(broker.position("SPY"), 0.0);
    }

    #[tokio::test]
    async fn test_sell_without_position_is_rejected() {
        let (h, broker, executor) =
            setup(StrategyParams::default(), order("o-1", OrderSide::Sell, 3.0, OrderType::MarketOnOpen)).await;

        let outcome = executor.execute("o-1").await.unwrap();
        assert_eq!(outcome, Outcome::rejected("no position to sell"));

        let stored = h.store.order("o-1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("no position to sell"));
        assert_eq!(broker.submissions(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_submission_resolved_by_client_id() {
        let (h, broker, executor) =
            setup(StrategyParams::default(), order("o-1", OrderSide::Buy, 2.0, OrderType::MarketOnOpen)).await;
        let first = broker
            .submit_order(&BrokerOrderRequest {
                client_order_id: "o-1".to_string(),
                symbol: "SPY".to_string(),
                side: OrderSide::Buy,
                qty: 2.0,
                time_in_force: TimeInForce::Opg,
            })
            .await
            .unwrap();

        assert_eq!(executor.execute("o-1").await.unwrap(), Outcome::Done);

        let stored = h.store.order("o-1").await.unwrap().unwrap();
        assert_eq!(stored.broker_order_id, Some(first.id));
        assert_eq!(stored.status, OrderStatus::Accepted);
        assert_eq!(broker.submissions(), 1);
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_submission() {
        let (h, broker, executor) =
            setup(StrategyParams::default(), order("o-1", OrderSide::Buy, 2.0, OrderType::MarketOnOpen)).await;
        h.ctx
            .kill_switch
            .activate("drill", KillSwitchSource::Manual)
            .await
            .unwrap();

        let outcome = executor.execute("o-1").await.unwrap();
        assert_eq!(outcome, Outcome::skipped("kill switch active"));
        assert_eq!(broker.submissions(), 0);
    }

    #[tokio::test]
    async fn test_fill_publish_failure_is_redriven_on_redelivery() {
        let mut params = StrategyParams::default();
        params.execution.order_type = OrderType::Market;
        let (h, broker, _) =
            setup(params, order("o-1", OrderSide::Sell, 5.0, OrderType::Market)).await;
        broker.set_position("SPY", 5.0);
        let executor = with_fill_outage(&h, &broker);

        // Filled at the broker, but the fill event could not be published.
        assert!(executor.execute("o-1").await.is_err());
        assert_eq!(status(&h, "o-1").await, OrderStatus::PendingExecution);
        assert_eq!(h.store.fills().len(), 1);
        assert!(h.stream.entries_of(FILLS_STREAM, "fill_created").is_empty());

        // The position is already flat; the retry must not reject the sell.
        assert_eq!(executor.execute("o-1").await.unwrap(), Outcome::Done);
        assert_eq!(status(&h, "o-1").await, OrderStatus::Filled);
        assert_eq!(h.store.fills().len(), 1);
        assert_eq!(h.stream.entries_of(FILLS_STREAM, "fill_created").len(), 1);
        assert_eq!(broker.submissions(), 1);
    }

    #[tokio::test]
    async fn test_fill_sync_publish_failure_is_retried() {
        let (h, broker, _) =
            setup(StrategyParams::default(), order("o-1", OrderSide::Buy, 20.0, OrderType::MarketOnOpen)).await;
        let executor = with_fill_outage(&h, &broker);
        assert_eq!(executor.execute("o-1").await.unwrap(), Outcome::Done);
        broker.fill_open_orders();

        assert!(executor.sync_fills().await.is_err());
        assert_eq!(status(&h, "o-1").await, OrderStatus::Accepted);

        // A redelivered order event finishes the job as well as the sweep would.
        assert_eq!(executor.execute("o-1").await.unwrap(), Outcome::Done);
        assert_eq!(status(&h, "o-1").await, OrderStatus::Filled);
        assert_eq!(h.stream.entries_of(FILLS_STREAM, "fill_created").len(), 1);
        assert_eq!(executor.sync_fills().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_kill_switch_after_claim_stops_submission() {
        let mut params = StrategyParams::default();
        params.execution.order_type = OrderType::Market;
        let (h, broker, _) =
            setup(params, order("o-1", OrderSide::Buy, 2.0, OrderType::Market)).await;
        let tripping = TripsKillSwitch {
            inner: broker.clone(),
            switch: h.ctx.kill_switch.clone(),
            at: Trip::OnClock,
        };
        let executor = BrokerExecutor::new(h.ctx.clone(), Arc::new(tripping));

        let outcome = executor.execute("o-1").await.unwrap();

        assert_eq!(outcome, Outcome::skipped("kill switch active"));
        assert_eq!(status(&h, "o-1").await, OrderStatus::Canceled);
        assert_eq!(broker.submissions(), 0);
    }

    #[tokio::test]
    async fn test_kill_switch_during_submission_cancels_at_broker() {
        let (h, broker, _) =
            setup(StrategyParams::default(), order("o-1", OrderSide::Buy, 2.0, OrderType::MarketOnOpen)).await;
        let tripping = TripsKillSwitch {
            inner: broker.clone(),
            switch: h.ctx.kill_switch.clone(),
            at: Trip::OnSubmit,
        };
        let executor = BrokerExecutor::new(h.ctx.clone(), Arc::new(tripping));

        let outcome = executor.execute("o-1").await.unwrap();
        assert_eq!(outcome, Outcome::skipped("order canceled"));

        let stored = h.store.order("o-1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Canceled);
        let broker_id = stored.broker_order_id.unwrap();
        assert_eq!(
            broker.get_order(&broker_id).await.unwrap().status,
            BrokerOrderStatus::Canceled
        );
        // Nothing left to fill at the open.
        assert_eq!(broker.fill_open_orders(), 0);
    }
}
