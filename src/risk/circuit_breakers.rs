use serde::{Deserialize, Serialize};

use crate::models::PortfolioState;

/// Circuit breakers that trip the kill switch automatically
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakers {
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.05, // -5% versus previous day's NAV
            max_drawdown_pct: 0.20,   // -20% from high-water mark
        }
    }
}

/// Inputs the breakers look at, taken from the ledger's portfolio state.
#[derive(Debug, Clone)]
pub struct TradingState {
    pub nav: f64,
    /// NAV at the close of the previous trading day, if known.
    pub previous_nav: Option<f64>,
    pub high_water_mark: f64,
}

impl TradingState {
    pub fn from_portfolio(state: &PortfolioState, previous: Option<&PortfolioState>) -> Self {
        Self {
            nav: state.nav,
            previous_nav: previous.map(|p| p.nav),
            high_water_mark: state.high_water_mark,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerTrip {
    DailyLoss { loss_pct: f64 },
    MaxDrawdown { drawdown: f64 },
}

impl CircuitBreakerTrip {
    pub fn describe(&self) -> String {
        match self {
            CircuitBreakerTrip::DailyLoss { loss_pct } => {
                format!("daily loss {:.2}% breached limit", loss_pct * 100.0)
            }
            CircuitBreakerTrip::MaxDrawdown { drawdown } => {
                format!("drawdown {:.2}% breached limit", drawdown * 100.0)
            }
        }
    }
}

impl CircuitBreakers {
    /// Daily loss is checked before drawdown; the first breach wins.
    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        if let Some(previous) = state.previous_nav.filter(|p| *p > 0.0) {
            let daily_pct = (state.nav - previous) / previous;
            if daily_pct < -self.max_daily_loss_pct {
                return Err(CircuitBreakerTrip::DailyLoss {
                    loss_pct: -daily_pct,
                });
            }
        }

        if state.high_water_mark > 0.0 {
            let drawdown = (state.high_water_mark - state.nav) / state.high_water_mark;
            if drawdown > self.max_drawdown_pct {
                return Err(CircuitBreakerTrip::MaxDrawdown { drawdown });
            }
        }

        Ok(())
    }
}
