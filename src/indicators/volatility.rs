//! Return and volatility estimators used by the signal generator.

pub const TRADING_DAYS: f64 = 252.0;

/// Simple returns `p_t / p_{t-1} - 1`. Non-positive prices yield no return.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// N-day lookback return measured from the close `lookback` bars before
/// the last one.
pub fn lookback_return(prices: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || prices.len() < lookback + 1 {
        return None;
    }
    let last = *prices.last()?;
    let base = prices[prices.len() - 1 - lookback];
    if base <= 0.0 {
        return None;
    }
    Some(last / base - 1.0)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Unbiased sample variance (n - 1 denominator).
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(ss / (values.len() - 1) as f64)
}

pub fn sample_std(values: &[f64]) -> Option<f64> {
    sample_variance(values).map(f64::sqrt)
}

/// Recursive EWMA variance `var_t = λ·var_{t-1} + (1-λ)·r_t²`, seeded
/// with the sample variance of the series, annualized with √252.
pub fn ewma_annualized_vol(returns: &[f64], lambda: f64) -> Option<f64> {
    let mut var = sample_variance(returns)?;
    for r in returns {
        var = lambda * var + (1.0 - lambda) * r * r;
    }
    // Guard against tiny negative values from rounding.
    Some(var.max(0.0).sqrt() * TRADING_DAYS.sqrt())
}
