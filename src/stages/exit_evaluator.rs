//! Exit rules on open positions, run on every bars batch.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{Outcome, Stage, StageContext, StageHandler};
use crate::config::StrategyParams;
use crate::events::{BarsEvent, StreamEntry, TargetEvent, TARGETS_STREAM};
use crate::indicators::atr_or_approximation;
use crate::models::{PositionState, TargetExposure};
use crate::position::{ExitTrigger, Persistence};
use crate::telemetry::{Alert, AlertLevel};
use crate::Result;

/// What happened to one position during an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Held,
    Exited(ExitTrigger),
    AlreadyEvaluated,
    NoData,
}

pub struct ExitEvaluator {
    ctx: StageContext,
}

impl ExitEvaluator {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Evaluate every open position against bars up to `date`. Returns the
    /// number of exits triggered.
    pub async fn run_for_date(&self, date: NaiveDate) -> Result<usize> {
        let params = self.ctx.params.snapshot();
        let positions = self.ctx.store.position_states(&self.ctx.portfolio_id).await?;

        let mut exits = 0;
        for state in positions.into_iter().filter(PositionState::is_open) {
            let symbol = state.symbol.clone();
            match self.evaluate(state, date, &params).await? {
                Evaluation::Exited(trigger) => {
                    exits += 1;
                    tracing::warn!(symbol = %symbol, "🛑 Exit triggered: {}", trigger.describe());
                }
                Evaluation::NoData => {
                    tracing::warn!(symbol = %symbol, "No bars to evaluate exits on {}", date);
                }
                Evaluation::Held | Evaluation::AlreadyEvaluated => {}
            }
        }
        Ok(exits)
    }

    async fn evaluate(
        &self,
        mut state: PositionState,
        date: NaiveDate,
        params: &StrategyParams,
    ) -> Result<Evaluation> {
        if !state.begin_evaluation(date) {
            return Ok(Evaluation::AlreadyEvaluated);
        }

        let period = params.exit.atr_period;
        let bars = self
            .ctx
            .market
            .daily_bars(&state.symbol, date, period + 1)
            .await?;
        let (Some(last), Some(atr)) = (bars.last(), atr_or_approximation(&bars, period)) else {
            return Ok(Evaluation::NoData);
        };
        let price = last.close;

        let signal = self
            .ctx
            .store
            .latest_signal(&params.signal.strategy_version, &state.symbol, date)
            .await?;
        if let Some(signal) = signal {
            if let Persistence::Pending { days, required } =
                state.observe_signal(signal.direction, date, params.exit.persistence_days)
            {
                tracing::info!(
                    symbol = %state.symbol,
                    "Reversal held by persistence filter ({}/{})",
                    days,
                    required
                );
            }
        }

        let Some(trigger) = state.check_exit(price, atr, &params.exit) else {
            state.update_extremes(price);
            self.ctx.store.save_position_state(&state).await?;
            return Ok(Evaluation::Held);
        };

        let target = TargetExposure {
            portfolio_id: self.ctx.portfolio_id.clone(),
            date,
            symbol: state.symbol.clone(),
            target_exposure: 0.0,
            scaling_factor: 0.0,
            is_capped: false,
            reason: trigger.describe(),
            is_exit: true,
        };
        if self.ctx.store.upsert_target_if_changed(&target).await? {
            self.ctx
                .publish(TARGETS_STREAM, &TargetEvent::for_target(&target))
                .await?;
        }

        state.force_exit();
        self.ctx.store.save_position_state(&state).await?;

        self.ctx.count("exits", Stage::Exits, trigger.reason.as_str()).await;
        self.ctx
            .telemetry
            .alert(Alert::new(
                AlertLevel::Info,
                Stage::Exits.name(),
                &self.ctx.portfolio_id,
                format!("{} exit: {}", target.symbol, trigger.describe()),
            ))
            .await;

        Ok(Evaluation::Exited(trigger))
    }
}

#[async_trait]
impl StageHandler for ExitEvaluator {
    fn name(&self) -> &str {
        Stage::Exits.name()
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<Outcome> {
        let event: BarsEvent = entry.decode()?;
        let exits = self.run_for_date(event.date()).await?;
        if exits == 0 {
            Ok(Outcome::skipped("no exits"))
        } else {
            Ok(Outcome::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Signal};
    use crate::position::ExitReason;
    use crate::stages::testing::{bars, harness};
    use crate::store::TradingStore;
    use crate::events::TargetPayload;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    async fn open_long(h: &crate::stages::testing::Harness, entry: f64, peak: f64) {
        let mut state = PositionState::flat("main", "SPY");
        state.apply_fill(10.0, entry, day(1), Some(2.0));
        state.update_extremes(peak);
        h.store.save_position_state(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_retrace_from_peak_forces_exit() {
        let h = harness(StrategyParams::default());
        open_long(&h, 100.0, 120.0).await;

        // Flat closes at 110 with a 2-point range: ATR 2, stop at 120 - 6 = 114.
        h.store.insert_bars(&bars("SPY", day(20), &[110.0; 20]));

        let evaluator = ExitEvaluator::new(h.ctx.clone());
        assert_eq!(evaluator.run_for_date(day(20)).await.unwrap(), 1);

        let state = h.store.position_state("main", "SPY").await.unwrap().unwrap();
        assert_eq!(state.direction, Direction::Flat);

        let target = h.store.target("main", day(20), "SPY").await.unwrap().unwrap();
        assert!(target.is_exit);
        assert_eq!(target.target_exposure, 0.0);
        assert!(target.reason.starts_with(ExitReason::TrailingStop.as_str()));

        let published = h.stream.entries_of(TARGETS_STREAM, "exit_triggered");
        assert_eq!(published.len(), 1);
        let event: TargetEvent = published[0].decode().unwrap();
        let payload: &TargetPayload = event.payload();
        assert!(payload.is_exit);

        // Redelivery of the same batch is a no-op.
        assert_eq!(evaluator.run_for_date(day(20)).await.unwrap(), 0);
        assert_eq!(h.stream.entries(TARGETS_STREAM).len(), 1);
    }

    #[tokio::test]
    async fn test_holding_position_updates_peak() {
        let h = harness(StrategyParams::default());
        open_long(&h, 100.0, 100.0).await;
        let mut closes = vec![100.0; 19];
        closes.push(104.0);
        h.store.insert_bars(&bars("SPY", day(20), &closes));

        let evaluator = ExitEvaluator::new(h.ctx.clone());
        assert_eq!(evaluator.run_for_date(day(20)).await.unwrap(), 0);

        let state = h.store.position_state("main", "SPY").await.unwrap().unwrap();
        assert_eq!(state.direction, Direction::Long);
        assert_eq!(state.peak_price, Some(104.0));
        assert_eq!(state.last_evaluated, Some(day(20)));
    }

    #[tokio::test]
    async fn test_reversal_signal_advances_persistence_counter() {
        let h = harness(StrategyParams::default());
        open_long(&h, 100.0, 100.0).await;
        h.store
            .upsert_signal(&Signal {
                strategy_version: "trend_v1".to_string(),
                symbol: "SPY".to_string(),
                date: day(19),
                lookback_return: -0.05,
                annualized_vol: 0.2,
                direction: Direction::Short,
                raw_target_weight: -0.5,
            })
            .await
            .unwrap();
        h.store.insert_bars(&bars("SPY", day(21), &[100.0; 21]));

        let evaluator = ExitEvaluator::new(h.ctx.clone());
        evaluator.run_for_date(day(20)).await.unwrap();
        evaluator.run_for_date(day(20)).await.unwrap();
        evaluator.run_for_date(day(21)).await.unwrap();

        let state = h.store.position_state("main", "SPY").await.unwrap().unwrap();
        assert_eq!(state.pending_direction, Some(Direction::Short));
        assert_eq!(state.consecutive_flip_days, 2);
        assert_eq!(state.direction, Direction::Long);
    }
}
