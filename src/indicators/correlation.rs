use chrono::NaiveDate;
use std::collections::HashMap;

use super::volatility::{mean, simple_returns};
use crate::models::Bar;

/// Pearson correlation of two equally long series.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 3 {
        return None;
    }
    let ma = mean(a)?;
    let mb = mean(b)?;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    if va <= f64::EPSILON || vb <= f64::EPSILON {
        return None;
    }
    Some((cov / (va.sqrt() * vb.sqrt())).clamp(-1.0, 1.0))
}

/// Correlation of daily returns over the last `lookback` dates both
/// instruments traded.
pub fn return_correlation(a: &[Bar], b: &[Bar], lookback: usize) -> Option<f64> {
    let b_closes: HashMap<NaiveDate, f64> = b.iter().map(|bar| (bar.date, bar.close)).collect();

    let mut common: Vec<(NaiveDate, f64, f64)> = a
        .iter()
        .filter_map(|bar| b_closes.get(&bar.date).map(|cb| (bar.date, bar.close, *cb)))
        .collect();
    common.sort_by_key(|(date, _, _)| *date);

    let start = common.len().saturating_sub(lookback + 1);
    let window = &common[start..];
    let closes_a: Vec<f64> = window.iter().map(|(_, ca, _)| *ca).collect();
    let closes_b: Vec<f64> = window.iter().map(|(_, _, cb)| *cb).collect();

    pearson(&simple_returns(&closes_a), &simple_returns(&closes_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(symbol: &str, closes: &[f64]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Bar {
                symbol: symbol.to_string(),
                date: start + chrono::Duration::days(i as i64),
                open: *close,
                high: None,
                low: None,
                close: *close,
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_pearson_extremes() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![2.0, 4.0, 6.0, 8.0];
        let c = vec![4.0, 3.0, 2.0, 1.0];
        assert!((pearson(&a, &b).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&a, &c).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson(&a, &[1.0, 1.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn test_return_correlation_aligns_dates() {
        let a = bars("A", &[100.0, 101.0, 99.0, 102.0, 101.0, 104.0]);
        let scaled: Vec<f64> = a.iter().map(|b| b.close * 2.0).collect();
        let mut b = bars("B", &scaled);
        // Drop one date from B; correlation still uses the shared dates
        b.remove(2);
        let corr = return_correlation(&a, &b, 10).unwrap();
        assert!(corr > 0.9);
    }
}
