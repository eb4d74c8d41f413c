/// Calculate Simple Moving Average (SMA) over the most recent `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Highest and lowest value of the most recent `window` prices (Donchian channel)
pub fn donchian_channel(prices: &[f64], window: usize) -> Option<(f64, f64)> {
    if window == 0 || prices.len() < window {
        return None;
    }

    let recent = &prices[prices.len() - window..];
    let high = recent.iter().copied().fold(f64::MIN, f64::max);
    let low = recent.iter().copied().fold(f64::MAX, f64::min);
    Some((high, low))
}
