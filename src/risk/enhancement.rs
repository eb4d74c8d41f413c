//! Multiplicative signal enhancements.
//!
//! Each factor is independently toggled. Missing inputs leave the weight
//! unchanged.

use std::collections::HashMap;

use super::sizing::WeightedTarget;
use crate::config::params::EnhancementParams;
use crate::models::{Direction, Fundamentals, MarketContext};

/// Weak trends scale toward `conviction_floor`; at or beyond
/// `conviction_full_return` the weight is untouched.
pub fn conviction_factor(lookback_return: f64, params: &EnhancementParams) -> f64 {
    let strength = (lookback_return.abs() / params.conviction_full_return).min(1.0);
    params.conviction_floor + (1.0 - params.conviction_floor) * strength
}

pub fn sentiment_factor(sentiment: f64, direction: Direction, strength: f64) -> f64 {
    (1.0 + strength * sentiment.clamp(-1.0, 1.0) * direction.sign()).max(0.0)
}

pub fn regime_factor(context: &MarketContext, params: &EnhancementParams) -> f64 {
    let weak_breadth = context
        .breadth
        .map(|b| b < params.regime_min_breadth)
        .unwrap_or(false);
    let high_vol = context
        .volatility_index
        .map(|v| v > params.regime_max_vix)
        .unwrap_or(false);

    if weak_breadth || high_vol {
        params.regime_scale
    } else {
        1.0
    }
}

/// One penalty per breached quality screen.
pub fn quality_factor(fundamentals: &Fundamentals, params: &EnhancementParams) -> f64 {
    let mut factor = 1.0;
    if fundamentals
        .market_cap
        .is_some_and(|cap| cap < params.quality_min_market_cap)
    {
        factor *= params.quality_penalty;
    }
    if fundamentals
        .beta
        .is_some_and(|beta| beta.abs() > params.quality_max_beta)
    {
        factor *= params.quality_penalty;
    }
    if fundamentals
        .avg_dollar_volume
        .is_some_and(|dv| dv < params.quality_min_dollar_volume)
    {
        factor *= params.quality_penalty;
    }
    factor
}

pub fn apply_enhancements(
    targets: &mut [WeightedTarget],
    context: Option<&MarketContext>,
    fundamentals: &HashMap<String, Fundamentals>,
    params: &EnhancementParams,
) {
    let regime = match (params.regime_enabled, context) {
        (true, Some(ctx)) => regime_factor(ctx, params),
        _ => 1.0,
    };

    for target in targets.iter_mut().filter(|t| t.weight != 0.0) {
        if params.conviction_enabled {
            let factor = conviction_factor(target.lookback_return, params);
            if factor < 1.0 {
                target.scale(factor, format!("conviction x{:.2}", factor));
            }
        }

        if params.sentiment_enabled {
            if let Some(sentiment) = context.and_then(|c| c.sentiment) {
                let factor = sentiment_factor(sentiment, target.direction, params.sentiment_strength);
                if (factor - 1.0).abs() > f64::EPSILON {
                    target.scale(factor, format!("sentiment x{:.2}", factor));
                }
            }
        }

        if regime < 1.0 {
            target.scale(regime, format!("regime x{:.2}", regime));
        }

        if params.quality_enabled {
            if let Some(fund) = fundamentals.get(&target.symbol) {
                let factor = quality_factor(fund, params);
                if factor < 1.0 {
                    target.scale(factor, format!("quality x{:.2}", factor));
                }
            } else {
                tracing::debug!(symbol = %target.symbol, "No fundamentals, quality screen skipped");
            }
        }
    }
}
