//! Target exposure to order translation.

use async_trait::async_trait;
use uuid::Uuid;

use super::{Outcome, Stage, StageContext, StageHandler};
use crate::config::params::ExecutionParams;
use crate::events::{OrderEvent, StreamEntry, TargetEvent, TargetPayload, ORDERS_STREAM};
use crate::models::{Order, OrderSide, OrderStatus};
use crate::position::QTY_EPSILON;
use crate::Result;

/// Round an order quantity: fractional sizing rounds to the configured
/// decimals, whole-share sizing truncates.
pub fn round_qty(qty: f64, params: &ExecutionParams) -> f64 {
    if params.fractional_shares {
        let scale = 10f64.powi(params.qty_decimals as i32);
        (qty * scale).round() / scale
    } else {
        qty.trunc()
    }
}

/// Signed share change needed to reach `exposure` of `nav`.
///
/// A full exit closes the exact held quantity so no rounding residue is
/// left behind.
pub fn order_delta(target: &TargetPayload, nav: f64, price: f64, current_qty: f64) -> f64 {
    if target.is_exit && target.target_exposure == 0.0 {
        return -current_qty;
    }
    target.target_exposure * nav / price - current_qty
}

pub struct OrderGenerator {
    ctx: StageContext,
}

impl OrderGenerator {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub async fn generate(&self, target: &TargetPayload) -> Result<Outcome> {
        let ctx = &self.ctx;
        if target.portfolio_id != ctx.portfolio_id {
            return Ok(Outcome::skipped(format!(
                "target for portfolio {}",
                target.portfolio_id
            )));
        }
        if ctx.kill_switch.is_active().await? {
            tracing::info!(symbol = %target.symbol, "Kill switch active, no order generated");
            ctx.count("orders_blocked", Stage::Orders, "kill_switch").await;
            return Ok(Outcome::skipped("kill switch active"));
        }

        let params = ctx.params.snapshot();
        let exec = &params.execution;

        let nav = ctx.nav().await?;
        let current_qty = ctx
            .store
            .holding(&ctx.portfolio_id, &target.symbol)
            .await?
            .map(|h| h.qty)
            .unwrap_or(0.0);
        let Some(price) = ctx
            .market
            .latest_close(&target.symbol, target.date)
            .await?
            .filter(|p| *p > 0.0)
        else {
            tracing::warn!(symbol = %target.symbol, "No price on or before {}, dropping target", target.date);
            return Ok(Outcome::skipped("no price"));
        };

        let delta = order_delta(target, nav, price, current_qty);
        let notional = (delta * price).abs();
        if notional < exec.min_notional {
            tracing::info!(
                symbol = %target.symbol,
                "Delta ${:.2} below minimum notional ${:.2}",
                notional,
                exec.min_notional
            );
            return Ok(Outcome::skipped("below minimum notional"));
        }

        let full_exit = target.is_exit && target.target_exposure == 0.0;
        let qty = if full_exit {
            delta.abs()
        } else {
            round_qty(delta.abs(), exec)
        };
        if qty < QTY_EPSILON {
            return Ok(Outcome::skipped("quantity rounds to zero"));
        }

        let order = Order {
            order_id: Uuid::new_v4().to_string(),
            portfolio_id: ctx.portfolio_id.clone(),
            date: target.date,
            symbol: target.symbol.clone(),
            side: if delta > 0.0 { OrderSide::Buy } else { OrderSide::Sell },
            qty,
            order_type: exec.order_type,
            status: OrderStatus::New,
            broker_order_id: None,
            rejection_reason: None,
        };

        if !ctx.store.insert_order(&order).await? {
            tracing::debug!(
                symbol = %order.symbol,
                "Order already exists for {} on {}",
                order.symbol,
                order.date
            );
            return Ok(Outcome::skipped("order exists for symbol and date"));
        }

        ctx.publish(ORDERS_STREAM, &OrderEvent::OrderCreated((&order).into()))
            .await?;
        tracing::info!(
            order_id = %order.order_id,
            "📝 {} {} {} @ ~${:.2} (target {:.2}% of ${:.0})",
            order.side.as_str(),
            order.qty,
            order.symbol,
            price,
            target.target_exposure * 100.0,
            nav
        );
        ctx.count("orders_created", Stage::Orders, order.side.as_str()).await;
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl StageHandler for OrderGenerator {
    fn name(&self) -> &str {
        Stage::Orders.name()
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<Outcome> {
        let event: TargetEvent = entry.decode()?;
        self.generate(event.payload()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyParams;
    use crate::models::{Holding, KillSwitchSource, OrderType};
    use crate::stages::testing::{bars, harness};
    use chrono::NaiveDate;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, 1).unwrap()
    }

    fn target(exposure: f64, is_exit: bool) -> TargetPayload {
        TargetPayload {
            portfolio_id: "main".to_string(),
            date: date(),
            symbol: "SPY".to_string(),
            target_exposure: exposure,
            reason: "signal".to_string(),
            is_exit,
        }
    }

    #[test]
    fn test_rounding_modes() {
        let mut params = ExecutionParams::default();
        params.qty_decimals = 2;
        assert_eq!(round_qty(3.14159, &params), 3.14);
        params.fractional_shares = false;
        assert_eq!(round_qty(3.99, &params), 3.0);
    }

    #[tokio::test]
    async fn test_buy_sized_from_nav_and_price() {
        let h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", date(), &[500.0]));

        let generator = OrderGenerator::new(h.ctx.clone());
        assert_eq!(generator.generate(&target(0.10, false)).await.unwrap(), Outcome::Done);

        let orders = h.store.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].qty, 20.0);
        assert_eq!(orders[0].status, OrderStatus::New);
        assert_eq!(orders[0].order_type, OrderType::MarketOnOpen);
        assert_eq!(h.stream.entries_of(ORDERS_STREAM, "order_created").len(), 1);
    }

    #[tokio::test]
    async fn test_second_order_same_day_is_noop() {
        let h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", date(), &[500.0]));
        let generator = OrderGenerator::new(h.ctx.clone());

        generator.generate(&target(0.10, false)).await.unwrap();
        let second = generator.generate(&target(0.05, false)).await.unwrap();

        assert!(matches!(second, Outcome::Skipped(_)));
        assert_eq!(h.store.orders().len(), 1);
        assert_eq!(h.stream.entries(ORDERS_STREAM).len(), 1);
    }

    #[tokio::test]
    async fn test_small_delta_is_dropped() {
        let h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", date(), &[500.0]));
        h.store.insert_holding(Holding {
            portfolio_id: "main".to_string(),
            date: date(),
            symbol: "SPY".to_string(),
            qty: 19.9,
            cost_basis: 490.0,
            market_value: 9_950.0,
        });

        let outcome = OrderGenerator::new(h.ctx.clone())
            .generate(&target(0.10, false))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skipped("below minimum notional"));
        assert!(h.store.orders().is_empty());
    }

    #[tokio::test]
    async fn test_exit_closes_exact_quantity() {
        let mut params = StrategyParams::default();
        params.execution.fractional_shares = false;
        let h = harness(params);
        h.store.insert_bars(&bars("SPY", date(), &[500.0]));
        h.store.insert_holding(Holding {
            portfolio_id: "main".to_string(),
            date: date(),
            symbol: "SPY".to_string(),
            qty: 12.3456,
            cost_basis: 480.0,
            market_value: 6_172.8,
        });

        OrderGenerator::new(h.ctx.clone())
            .generate(&target(0.0, true))
            .await
            .unwrap();

        let orders = h.store.orders();
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].qty, 12.3456);
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_generation() {
        let h = harness(StrategyParams::default());
        h.store.insert_bars(&bars("SPY", date(), &[500.0]));
        h.ctx
            .kill_switch
            .activate("test", KillSwitchSource::Manual)
            .await
            .unwrap();

        let outcome = OrderGenerator::new(h.ctx.clone())
            .generate(&target(0.10, false))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skipped("kill switch active"));
        assert!(h.store.orders().is_empty());
    }
}
