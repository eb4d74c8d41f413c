//! Seeded synthetic daily bars for dry runs and tests.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

use crate::error::PipelineError;
use crate::models::Bar;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+0.2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-0.2% daily average)
    Downtrend,
    /// Mean-reverting chop around the base price
    Sideways,
    /// ±4% daily swings
    Volatile,
    /// Rally then a 25% slide, for exit and breaker drills
    Drawdown,
}

impl FromStr for MarketScenario {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uptrend" | "up" => Ok(MarketScenario::Uptrend),
            "downtrend" | "down" => Ok(MarketScenario::Downtrend),
            "sideways" => Ok(MarketScenario::Sideways),
            "volatile" => Ok(MarketScenario::Volatile),
            "drawdown" => Ok(MarketScenario::Drawdown),
            other => Err(PipelineError::Config(format!("unknown scenario {}", other))),
        }
    }
}

/// The `days` weekdays ending on or before `end`, oldest first.
pub fn trading_days(end: NaiveDate, days: usize) -> Vec<NaiveDate> {
    let mut dates = Vec::with_capacity(days);
    let mut date = end;
    while dates.len() < days {
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(date);
        }
        date -= Duration::days(1);
    }
    dates.reverse();
    dates
}

pub struct SyntheticBars {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
}

impl SyntheticBars {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 100.0,
            base_volume: 1_000_000.0,
        }
    }

    pub fn with_base_price(mut self, price: f64) -> Self {
        self.base_price = price;
        self
    }

    /// Generate `days` trading-day bars for `symbol` ending at `end`.
    pub fn generate(
        &mut self,
        symbol: &str,
        scenario: MarketScenario,
        end: NaiveDate,
        days: usize,
    ) -> Vec<Bar> {
        let mut price = self.base_price;
        let mut bars = Vec::with_capacity(days);

        for (i, date) in trading_days(end, days).into_iter().enumerate() {
            let change = match scenario {
                MarketScenario::Uptrend => 0.002 + self.rng.gen_range(-0.005..0.005),
                MarketScenario::Downtrend => -0.002 + self.rng.gen_range(-0.005..0.005),
                MarketScenario::Sideways => {
                    (self.base_price - price) / price * 0.1 + self.rng.gen_range(-0.01..0.01)
                }
                MarketScenario::Volatile => self.rng.gen_range(-0.04..0.04),
                MarketScenario::Drawdown => {
                    if i < days / 2 {
                        self.rng.gen_range(-0.003..0.006)
                    } else {
                        -0.25 / (days as f64 / 2.0) + self.rng.gen_range(-0.003..0.003)
                    }
                }
            };
            price *= 1.0 + change;
            if scenario == MarketScenario::Volatile {
                price = price.max(self.base_price * 0.5);
            }
            bars.push(self.bar(symbol, date, price));
        }

        bars
    }

    fn bar(&mut self, symbol: &str, date: NaiveDate, close: f64) -> Bar {
        // ±1% intraday range around the close
        let range = 0.01;
        let high = close * (1.0 + self.rng.gen_range(0.0..range));
        let low = close * (1.0 - self.rng.gen_range(0.0..range));
        let open = (close * (1.0 + self.rng.gen_range(-range..range))).clamp(low, high);

        Bar {
            symbol: symbol.to_string(),
            date,
            open,
            high: Some(high),
            low: Some(low),
            close,
            volume: (self.base_volume * self.rng.gen_range(0.7..1.3)).round(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 28).unwrap()
    }

    #[test]
    fn test_trading_days_skip_weekends() {
        let days = trading_days(end(), 10);
        assert_eq!(days.len(), 10);
        assert_eq!(days.last(), Some(&end()));
        assert!(days
            .iter()
            .all(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun)));
        assert!(days.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_uptrend_ends_higher() {
        let bars = SyntheticBars::new(42).generate("SYN", MarketScenario::Uptrend, end(), 250);
        assert_eq!(bars.len(), 250);
        assert!(bars[249].close > bars[0].close);
    }

    #[test]
    fn test_same_seed_same_series() {
        let a = SyntheticBars::new(7).generate("SYN", MarketScenario::Volatile, end(), 50);
        let b = SyntheticBars::new(7).generate("SYN", MarketScenario::Volatile, end(), 50);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ohlc_consistency() {
        let bars = SyntheticBars::new(42).generate("SYN", MarketScenario::Drawdown, end(), 100);
        for bar in &bars {
            let (high, low) = (bar.high.unwrap(), bar.low.unwrap());
            assert!(high >= bar.close && high >= bar.open);
            assert!(low <= bar.close && low <= bar.open);
        }
        assert!(bars[99].close < bars[49].close);
    }
}
