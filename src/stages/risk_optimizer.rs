//! Portfolio optimizer: raw signal weights to capped target exposures.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;

use super::{Outcome, Stage, StageContext, StageHandler};
use crate::config::StrategyParams;
use crate::events::{SignalEvent, StreamEntry, TargetEvent, TARGETS_STREAM};
use crate::models::{Bar, Fundamentals, Instrument, MarketContext, Signal, TargetExposure};
use crate::risk::correlation::apply_correlation_throttle;
use crate::risk::diversification::apply_diversification;
use crate::risk::enhancement::apply_enhancements;
use crate::risk::sizing::{apply_drawdown_scaling, apply_gross_cap, apply_position_cap};
use crate::risk::WeightedTarget;
use crate::store::truncate_exposure;
use crate::Result;

/// Everything besides the signals that sizing depends on.
#[derive(Debug, Clone, Default)]
pub struct OptimizerInputs {
    pub drawdown: f64,
    pub context: Option<MarketContext>,
    pub fundamentals: HashMap<String, Fundamentals>,
    pub instruments: HashMap<String, Instrument>,
    /// Held signed exposure per symbol as a fraction of NAV.
    pub current_exposure: HashMap<String, f64>,
    pub history: HashMap<String, Vec<Bar>>,
    /// Symbols whose reversal is still held by the persistence filter.
    pub pending_flips: HashMap<String, (u32, u32)>,
}

/// Run the sizing pipeline. Gross and single-instrument caps hold for the
/// result; diversification and the correlation throttle only shrink
/// weights further.
pub fn size_targets(
    signals: &[Signal],
    inputs: &OptimizerInputs,
    params: &StrategyParams,
) -> Vec<WeightedTarget> {
    let risk = &params.risk;
    let mut targets: Vec<WeightedTarget> = signals.iter().map(WeightedTarget::from_signal).collect();

    apply_enhancements(
        &mut targets,
        inputs.context.as_ref(),
        &inputs.fundamentals,
        &params.enhancement,
    );

    for target in targets.iter_mut() {
        if let Some((days, required)) = inputs.pending_flips.get(&target.symbol) {
            let held = inputs.current_exposure.get(&target.symbol).copied().unwrap_or(0.0);
            target.weight = held;
            target
                .notes
                .push(format!("persistence hold {}/{}", days, required));
        }
    }

    apply_drawdown_scaling(
        &mut targets,
        inputs.drawdown,
        risk.drawdown_threshold,
        risk.drawdown_scale,
    );
    apply_gross_cap(&mut targets, risk.max_gross_exposure);
    apply_position_cap(&mut targets, risk.max_position_weight);

    if risk.diversification_enabled {
        apply_diversification(&mut targets, &inputs.instruments, risk);
    }
    if risk.correlation_enabled {
        apply_correlation_throttle(&mut targets, &inputs.current_exposure, &inputs.history, risk);
    }

    targets
}

pub struct RiskOptimizer {
    ctx: StageContext,
}

impl RiskOptimizer {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    async fn gather_inputs(
        &self,
        date: NaiveDate,
        signals: &[Signal],
        params: &StrategyParams,
    ) -> Result<OptimizerInputs> {
        let ctx = &self.ctx;
        let symbols: Vec<String> = signals.iter().map(|s| s.symbol.clone()).collect();
        let latest_state = ctx.store.latest_portfolio_state(&ctx.portfolio_id).await?;
        let nav = latest_state
            .as_ref()
            .map(|s| s.nav)
            .filter(|nav| *nav > 0.0)
            .unwrap_or(ctx.initial_capital);

        let mut inputs = OptimizerInputs {
            drawdown: latest_state.map(|s| s.drawdown).unwrap_or(0.0),
            ..OptimizerInputs::default()
        };

        let enhancement = &params.enhancement;
        if enhancement.sentiment_enabled || enhancement.regime_enabled {
            inputs.context = ctx.market.market_context(date).await?;
        }
        if enhancement.quality_enabled {
            inputs.fundamentals = ctx.market.fundamentals(&symbols).await?;
        }
        if params.risk.diversification_enabled {
            inputs.instruments = ctx.market.instruments(&symbols).await?;
        }

        for holding in ctx.store.holdings(&ctx.portfolio_id).await? {
            inputs
                .current_exposure
                .insert(holding.symbol.clone(), holding.market_value / nav);
        }

        if params.risk.correlation_enabled && !inputs.current_exposure.is_empty() {
            let lookback = params.risk.correlation_lookback + 1;
            let mut wanted: Vec<&String> = symbols.iter().collect();
            wanted.extend(inputs.current_exposure.keys());
            wanted.sort();
            wanted.dedup();
            for symbol in wanted {
                let bars = ctx.market.daily_bars(symbol, date, lookback).await?;
                inputs.history.insert(symbol.clone(), bars);
            }
        }

        let required = params.exit.persistence_days;
        for state in ctx.store.position_states(&ctx.portfolio_id).await? {
            if !state.is_holding_flip(required) {
                continue;
            }
            let signal_direction = signals
                .iter()
                .find(|s| s.symbol == state.symbol)
                .map(|s| s.direction);
            if signal_direction.is_some() && signal_direction == state.pending_direction {
                inputs
                    .pending_flips
                    .insert(state.symbol.clone(), (state.consecutive_flip_days, required));
            }
        }

        Ok(inputs)
    }

    /// Size targets for the latest signal date on or before `date` and
    /// publish the ones that changed. Returns the number published.
    pub async fn run_for_date(&self, date: NaiveDate) -> Result<usize> {
        let params = self.ctx.params.snapshot();
        let strategy = &params.signal.strategy_version;

        let Some(signal_date) = self.ctx.store.latest_signal_date(strategy, date).await? else {
            tracing::warn!("No {} signals on or before {}", strategy, date);
            return Ok(0);
        };
        if signal_date != date {
            tracing::warn!("No signals for {}, falling back to {}", date, signal_date);
        }

        let signals = self.ctx.store.signals_for_date(strategy, signal_date).await?;
        let inputs = self.gather_inputs(date, &signals, &params).await?;
        let targets = size_targets(&signals, &inputs, &params);

        let mut published = 0;
        for target in &targets {
            let exposure = TargetExposure {
                portfolio_id: self.ctx.portfolio_id.clone(),
                date,
                symbol: target.symbol.clone(),
                target_exposure: truncate_exposure(target.weight),
                scaling_factor: target.scaling_factor(),
                is_capped: target.is_capped,
                reason: target.reason(),
                is_exit: false,
            };

            if !self.ctx.store.upsert_target_if_changed(&exposure).await? {
                tracing::debug!(symbol = %exposure.symbol, "Target unchanged or held by exit");
                continue;
            }
            self.ctx
                .publish(TARGETS_STREAM, &TargetEvent::for_target(&exposure))
                .await?;
            published += 1;
        }

        tracing::info!(
            "🎯 Targets for {}: {} sized, {} published (gross {:.3})",
            date,
            targets.len(),
            published,
            crate::risk::sizing::gross_exposure(&targets)
        );
        Ok(published)
    }
}

#[async_trait]
impl StageHandler for RiskOptimizer {
    fn name(&self) -> &str {
        Stage::Optimizer.name()
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<Outcome> {
        match entry.decode::<SignalEvent>()? {
            SignalEvent::SignalGenerated { .. } => Ok(Outcome::skipped("waiting for batch")),
            SignalEvent::SignalsBatchComplete { date, .. } => {
                let published = self.run_for_date(date).await?;
                if published == 0 {
                    Ok(Outcome::skipped("no target changes"))
                } else {
                    Ok(Outcome::Done)
                }
            }
        }
    }
}
