//! Average True Range, used for trailing-stop distances and the exit
//! evaluator's entry ATR.
//!
//! True range per bar is the widest of high-low, |high - prev close| and
//! |low - prev close|, smoothed with Wilder's method. Close-only bars fall
//! back to [`close_to_close_atr`].

use crate::indicators::volatility::{sample_std, simple_returns};
use crate::models::Bar;

/// Latest ATR, or None without `period + 1` bars carrying high/low.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    calculate_atr_series(bars, period).last().copied()
}

/// ATR values from bar index `period` onward.
pub fn calculate_atr_series(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() < period + 1 {
        return Vec::new();
    }

    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let (high, low) = match (bars[i].high, bars[i].low) {
            (Some(high), Some(low)) => (high, low),
            _ => return Vec::new(),
        };
        let prev_close = bars[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        true_ranges.push(tr);
    }

    // Seed with the simple mean, then Wilder smoothing
    let n = period as f64;
    let seed = true_ranges[..period].iter().sum::<f64>() / n;
    let mut series = Vec::with_capacity(true_ranges.len() - period + 1);
    series.push(seed);
    for tr in &true_ranges[period..] {
        let prev = series[series.len() - 1];
        series.push((prev * (n - 1.0) + tr) / n);
    }
    series
}

/// ATR approximation for close-only data: standard deviation of the last
/// `period` close-to-close returns scaled by the latest close.
pub fn close_to_close_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period < 2 || bars.len() < period + 1 {
        return None;
    }
    let closes: Vec<f64> = bars[bars.len() - period - 1..]
        .iter()
        .map(|b| b.close)
        .collect();
    let returns = simple_returns(&closes);
    let std = sample_std(&returns)?;
    let last = *closes.last()?;
    Some(std * last)
}

/// True ATR when high/low are available, otherwise the close-to-close
/// approximation.
pub fn atr_or_approximation(bars: &[Bar], period: usize) -> Option<f64> {
    calculate_atr(bars, period).or_else(|| close_to_close_atr(bars, period))
}
