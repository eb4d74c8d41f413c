//! Trend/volatility signal per symbol on each bars batch.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{Outcome, Stage, StageContext, StageHandler};
use crate::config::params::{Confirmation, SignalParams, StrategyParams};
use crate::error::PipelineError;
use crate::events::{BarsEvent, StreamEntry, SIGNALS_STREAM};
use crate::indicators::{calculate_sma, donchian_channel, ewma_annualized_vol, lookback_return, simple_returns};
use crate::models::{Direction, Signal};
use crate::Result;

/// Whether the confirmation filter agrees with `direction` on `closes`.
pub fn is_confirmed(closes: &[f64], direction: Direction, params: &SignalParams) -> bool {
    let Some(&last) = closes.last() else {
        return false;
    };

    let donchian = || match donchian_channel(closes, params.donchian_window) {
        Some((high, low)) => match direction {
            Direction::Long => last >= high,
            Direction::Short => last <= low,
            Direction::Flat => false,
        },
        None => false,
    };
    let dual_ma = || {
        match (
            calculate_sma(closes, params.fast_ma),
            calculate_sma(closes, params.slow_ma),
        ) {
            (Some(fast), Some(slow)) => match direction {
                Direction::Long => fast > slow,
                Direction::Short => fast < slow,
                Direction::Flat => false,
            },
            _ => false,
        }
    };

    match params.confirmation {
        Confirmation::None => true,
        Confirmation::Donchian => donchian(),
        Confirmation::DualMa => dual_ma(),
        Confirmation::Both => donchian() && dual_ma(),
    }
}

/// Compute one signal from a close series ending at `date`.
///
/// Errors with [`PipelineError::Data`] when the series is shorter than
/// `required` closes.
pub fn compute_signal(
    symbol: &str,
    date: NaiveDate,
    closes: &[f64],
    params: &StrategyParams,
) -> Result<Signal> {
    let required = params.required_history();
    if closes.len() < required {
        return Err(PipelineError::Data(format!(
            "{}: {} bars, need {}",
            symbol,
            closes.len(),
            required
        )));
    }
    let signal = &params.signal;

    let lookback = lookback_return(closes, signal.lookback_days).ok_or_else(|| {
        PipelineError::Data(format!("{}: no lookback return", symbol))
    })?;

    let window = &closes[closes.len() - signal.lookback_days - 1..];
    let returns = simple_returns(window);
    let vol = ewma_annualized_vol(&returns, signal.ewma_lambda).unwrap_or(0.0);

    let mut direction = Direction::from_sign(lookback);
    if !direction.is_flat() && !is_confirmed(closes, direction, signal) {
        direction = Direction::Flat;
    }

    let raw_target_weight = if direction.is_flat() || vol < signal.min_vol {
        0.0
    } else {
        signal.target_vol / vol * direction.sign()
    };

    Ok(Signal {
        strategy_version: signal.strategy_version.clone(),
        symbol: symbol.to_string(),
        date,
        lookback_return: lookback,
        annualized_vol: vol,
        direction,
        raw_target_weight,
    })
}

pub struct SignalGenerator {
    ctx: StageContext,
}

impl SignalGenerator {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Generate, persist and publish signals for a batch. Returns
    /// `(processed, failed)`.
    pub async fn run_batch(&self, date: NaiveDate, symbols: &[String]) -> Result<(usize, usize)> {
        let params = self.ctx.params.snapshot();
        let required = params.required_history();
        let mut processed = 0;
        let mut failed = 0;

        for symbol in symbols {
            let bars = self.ctx.market.daily_bars(symbol, date, required).await?;
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

            let signal = match compute_signal(symbol, date, &closes, &params) {
                Ok(signal) => signal,
                Err(PipelineError::Data(reason)) => {
                    tracing::warn!(symbol = %symbol, "Skipping signal: {}", reason);
                    failed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.ctx.store.upsert_signal(&signal).await?;
            self.ctx
                .publish(SIGNALS_STREAM, &crate::events::SignalEvent::from(&signal))
                .await?;
            tracing::debug!(
                symbol = %symbol,
                direction = signal.direction.as_i8(),
                weight = signal.raw_target_weight,
                "Signal saved"
            );
            processed += 1;
        }

        self.ctx
            .publish(
                SIGNALS_STREAM,
                &crate::events::SignalEvent::SignalsBatchComplete {
                    date,
                    symbols_processed: processed,
                    symbols_failed: failed,
                },
            )
            .await?;

        tracing::info!(
            "📈 Signals for {}: {} processed, {} failed",
            date,
            processed,
            failed
        );
        Ok((processed, failed))
    }
}

#[async_trait]
impl StageHandler for SignalGenerator {
    fn name(&self) -> &str {
        Stage::Signals.name()
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<Outcome> {
        let event: BarsEvent = entry.decode()?;
        let symbols = event.symbols();
        if symbols.is_empty() {
            return Ok(Outcome::skipped("empty bars batch"));
        }

        let (_, failed) = self.run_batch(event.date(), &symbols).await?;
        if failed > 0 {
            self.ctx.count("signals_failed", Stage::Signals, "data").await;
        }
        Ok(Outcome::Done)
    }
}
