//! Correlation throttle for new or growing positions.

use std::collections::HashMap;

use super::sizing::WeightedTarget;
use crate::config::params::RiskParams;
use crate::indicators::return_correlation;
use crate::models::Bar;

/// Most correlated existing position for a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedPeer {
    pub symbol: String,
    pub correlation: f64,
}

pub fn most_correlated_peer(
    symbol: &str,
    peers: &[&str],
    history: &HashMap<String, Vec<Bar>>,
    lookback: usize,
) -> Option<CorrelatedPeer> {
    let own = history.get(symbol)?;
    peers
        .iter()
        .filter(|peer| **peer != symbol)
        .filter_map(|peer| {
            let bars = history.get(*peer)?;
            let corr = return_correlation(own, bars, lookback)?;
            Some(CorrelatedPeer {
                symbol: peer.to_string(),
                correlation: corr,
            })
        })
        .max_by(|a, b| a.correlation.abs().total_cmp(&b.correlation.abs()))
}

/// Whether moving from `held` to `weight` opens a position or grows it in
/// the held direction. Reducing, closing and flipping to the other side do
/// not count.
pub fn increases_exposure(weight: f64, held: f64) -> bool {
    if held.abs() <= 1e-12 {
        return weight.abs() > 1e-12;
    }
    weight * held.signum() > held.abs() + 1e-12
}

/// Throttle targets that open or increase exposure while highly
/// correlated with a position already held. `current` maps symbol to the
/// held signed exposure (fraction of NAV).
pub fn apply_correlation_throttle(
    targets: &mut [WeightedTarget],
    current: &HashMap<String, f64>,
    history: &HashMap<String, Vec<Bar>>,
    params: &RiskParams,
) -> usize {
    let peers: Vec<&str> = current
        .iter()
        .filter(|(_, exposure)| exposure.abs() >= params.min_position_exposure)
        .map(|(symbol, _)| symbol.as_str())
        .collect();
    if peers.is_empty() {
        return 0;
    }

    let mut throttled = 0;
    for target in targets.iter_mut() {
        let held = current.get(&target.symbol).copied().unwrap_or(0.0);
        if !increases_exposure(target.weight, held) {
            continue;
        }

        let Some(peer) =
            most_correlated_peer(&target.symbol, &peers, history, params.correlation_lookback)
        else {
            continue;
        };

        if peer.correlation.abs() > params.correlation_threshold {
            target.cap(
                params.correlation_throttle,
                format!(
                    "correlation {:.2} with {} > {:.2}: x{:.2}",
                    peer.correlation,
                    peer.symbol,
                    params.correlation_threshold,
                    params.correlation_throttle
                ),
            );
            throttled += 1;
        }
    }
    throttled
}
