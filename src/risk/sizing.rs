//! Portfolio-level sizing steps applied to signal weights.

use crate::models::{Direction, Signal};

/// A symbol's weight as it moves through the optimizer pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTarget {
    pub symbol: String,
    pub direction: Direction,
    pub lookback_return: f64,
    /// Weight as produced by the signal generator.
    pub raw_weight: f64,
    pub weight: f64,
    pub is_capped: bool,
    pub notes: Vec<String>,
}

impl WeightedTarget {
    pub fn from_signal(signal: &Signal) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            lookback_return: signal.lookback_return,
            raw_weight: signal.raw_target_weight,
            weight: signal.raw_target_weight,
            is_capped: false,
            notes: Vec::new(),
        }
    }

    pub fn scale(&mut self, factor: f64, note: impl Into<String>) {
        self.weight *= factor;
        self.notes.push(note.into());
    }

    pub fn cap(&mut self, factor: f64, note: impl Into<String>) {
        self.scale(factor, note);
        self.is_capped = true;
    }

    /// Final weight relative to the raw signal weight.
    pub fn scaling_factor(&self) -> f64 {
        if self.raw_weight.abs() < f64::EPSILON {
            1.0
        } else {
            self.weight / self.raw_weight
        }
    }

    pub fn reason(&self) -> String {
        if self.notes.is_empty() {
            "signal".to_string()
        } else {
            self.notes.join("; ")
        }
    }
}

pub fn gross_exposure(targets: &[WeightedTarget]) -> f64 {
    targets.iter().map(|t| t.weight.abs()).sum()
}

/// Scale every weight when drawdown exceeds the threshold.
pub fn apply_drawdown_scaling(
    targets: &mut [WeightedTarget],
    drawdown: f64,
    threshold: f64,
    scale: f64,
) -> bool {
    if drawdown <= threshold {
        return false;
    }
    let note = format!(
        "drawdown {:.1}% > {:.1}%: x{:.2}",
        drawdown * 100.0,
        threshold * 100.0,
        scale
    );
    for target in targets.iter_mut().filter(|t| t.weight != 0.0) {
        target.scale(scale, note.clone());
    }
    true
}

/// Proportionally scale all weights so the gross sum meets the cap.
/// Returns the applied factor when scaling happened.
pub fn apply_gross_cap(targets: &mut [WeightedTarget], max_gross: f64) -> Option<f64> {
    let gross = gross_exposure(targets);
    if gross <= max_gross || gross <= 0.0 {
        return None;
    }
    let factor = max_gross / gross;
    let note = format!("gross {:.2} > cap {:.2}: x{:.3}", gross, max_gross, factor);
    for target in targets.iter_mut().filter(|t| t.weight != 0.0) {
        target.cap(factor, note.clone());
    }
    Some(factor)
}

/// Clamp each |weight| to the single-instrument cap, keeping the sign.
pub fn apply_position_cap(targets: &mut [WeightedTarget], max_weight: f64) -> usize {
    let mut capped = 0;
    for target in targets.iter_mut() {
        if target.weight.abs() > max_weight {
            target.weight = max_weight * target.weight.signum();
            target.is_capped = true;
            target
                .notes
                .push(format!("capped at {:.1}%", max_weight * 100.0));
            capped += 1;
        }
    }
    capped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(symbol: &str, weight: f64) -> WeightedTarget {
        WeightedTarget {
            symbol: symbol.to_string(),
            direction: Direction::from_sign(weight),
            lookback_return: 0.05 * weight.signum(),
            raw_weight: weight,
            weight,
            is_capped: false,
            notes: Vec::new(),
        }
    }

    #[test]
    fn test_drawdown_scaling_only_above_threshold() {
        let mut targets = vec![target("A", 0.2), target("B", -0.1)];
        assert!(!apply_drawdown_scaling(&mut targets, 0.05, 0.10, 0.5));
        assert_eq!(targets[0].weight, 0.2);

        assert!(apply_drawdown_scaling(&mut targets, 0.12, 0.10, 0.5));
        assert!((targets[0].weight - 0.1).abs() < 1e-12);
        assert!((targets[1].weight + 0.05).abs() < 1e-12);
        assert!(targets[0].reason().starts_with("drawdown"));
    }

    #[test]
    fn test_gross_cap_scales_proportionally() {
        let mut targets = vec![target("A", 0.9), target("B", -0.6), target("C", 0.0)];
        let factor = apply_gross_cap(&mut targets, 1.0).unwrap();
        assert!((factor - 1.0 / 1.5).abs() < 1e-12);
        assert!((gross_exposure(&targets) - 1.0).abs() < 1e-12);
        assert!(targets[0].is_capped);
        assert!(!targets[2].is_capped);
    }

    #[test]
    fn test_position_cap_keeps_sign() {
        let mut targets = vec![target("A", 0.3), target("B", -0.25), target("C", 0.05)];
        assert_eq!(apply_position_cap(&mut targets, 0.1), 2);
        assert_eq!(targets[0].weight, 0.1);
        assert_eq!(targets[1].weight, -0.1);
        assert_eq!(targets[2].weight, 0.05);
        assert!((targets[0].scaling_factor() - 1.0 / 3.0).abs() < 1e-12);
    }
}
