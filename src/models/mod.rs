use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Daily OHLCV bar. High/low are optional because some providers only
/// deliver closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: f64,
}

/// Trade direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Direction {
    Short,
    #[default]
    Flat,
    Long,
}

impl Direction {
    pub fn from_sign(value: f64) -> Self {
        if value > 0.0 {
            Direction::Long
        } else if value < 0.0 {
            Direction::Short
        } else {
            Direction::Flat
        }
    }

    pub fn as_i8(self) -> i8 {
        match self {
            Direction::Short => -1,
            Direction::Flat => 0,
            Direction::Long => 1,
        }
    }

    pub fn sign(self) -> f64 {
        self.as_i8() as f64
    }

    pub fn is_flat(self) -> bool {
        self == Direction::Flat
    }
}

impl From<Direction> for i8 {
    fn from(direction: Direction) -> Self {
        direction.as_i8()
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Direction::Short),
            0 => Ok(Direction::Flat),
            1 => Ok(Direction::Long),
            other => Err(format!("invalid direction {}", other)),
        }
    }
}

/// Per-symbol trend signal for one strategy version and date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub strategy_version: String,
    pub symbol: String,
    pub date: NaiveDate,
    pub lookback_return: f64,
    pub annualized_vol: f64,
    pub direction: Direction,
    pub raw_target_weight: f64,
}

/// Desired signed exposure for a symbol as a fraction of NAV.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetExposure {
    pub portfolio_id: String,
    pub date: NaiveDate,
    pub symbol: String,
    pub target_exposure: f64,
    pub scaling_factor: f64,
    pub is_capped: bool,
    pub reason: String,
    pub is_exit: bool,
}

impl TargetExposure {
    /// True when value, capped flag or reason differ from `other`.
    pub fn differs_from(&self, other: &TargetExposure) -> bool {
        (self.target_exposure - other.target_exposure).abs() > 1e-9
            || self.is_capped != other.is_capped
            || self.reason != other.reason
            || self.is_exit != other.is_exit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

impl FromStr for OrderSide {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(PipelineError::Data(format!("unknown order side {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Queued for the next opening auction.
    MarketOnOpen,
    /// Immediate market order, requires an open market.
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::MarketOnOpen => "market_on_open",
            OrderType::Market => "market",
        }
    }
}

impl FromStr for OrderType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market_on_open" | "moo" => Ok(OrderType::MarketOnOpen),
            "market" => Ok(OrderType::Market),
            other => Err(PipelineError::Data(format!("unknown order type {}", other))),
        }
    }
}

/// Order lifecycle.
///
/// NEW -> PENDING_EXECUTION -> SUBMITTED -> ACCEPTED | FILLED | FAILED | REJECTED,
/// ACCEPTED -> FILLED via fill sync, pending-like -> CANCELED via the kill switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PendingExecution,
    Submitted,
    Accepted,
    Filled,
    Failed,
    Rejected,
    Canceled,
}

impl OrderStatus {
    pub const PENDING_LIKE: [OrderStatus; 4] = [
        OrderStatus::New,
        OrderStatus::PendingExecution,
        OrderStatus::Submitted,
        OrderStatus::Accepted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PendingExecution => "PENDING_EXECUTION",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Failed | OrderStatus::Rejected | OrderStatus::Canceled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PENDING_EXECUTION" => Ok(OrderStatus::PendingExecution),
            "SUBMITTED" => Ok(OrderStatus::Submitted),
            "ACCEPTED" => Ok(OrderStatus::Accepted),
            "FILLED" => Ok(OrderStatus::Filled),
            "FAILED" => Ok(OrderStatus::Failed),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "CANCELED" => Ok(OrderStatus::Canceled),
            other => Err(PipelineError::Data(format!("unknown order status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub portfolio_id: String,
    pub date: NaiveDate,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Execution report. `fill_id` is derived from the broker order id and is
/// the ledger's idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub date: NaiveDate,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub price: f64,
    pub commission: f64,
    /// Price came from the latest trade after a fill-wait timeout.
    pub is_estimated: bool,
}

impl Fill {
    pub fn id_for_broker_order(broker_order_id: &str) -> String {
        format!("fill-{}", broker_order_id)
    }
}

/// Current holding snapshot; qty is signed (negative for shorts) and
/// cost_basis is the per-unit average cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Holding {
    pub portfolio_id: String,
    pub date: NaiveDate,
    pub symbol: String,
    pub qty: f64,
    pub cost_basis: f64,
    pub market_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioState {
    pub portfolio_id: String,
    pub date: NaiveDate,
    pub nav: f64,
    pub cash: f64,
    pub gross_exposure: f64,
    pub net_exposure: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub drawdown: f64,
    pub high_water_mark: f64,
}

impl PortfolioState {
    /// Opening state for a portfolio with no ledger history.
    pub fn initial(portfolio_id: &str, date: NaiveDate, capital: f64) -> Self {
        Self {
            portfolio_id: portfolio_id.to_string(),
            date,
            nav: capital,
            cash: capital,
            gross_exposure: 0.0,
            net_exposure: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            drawdown: 0.0,
            high_water_mark: capital,
        }
    }
}

/// Per-symbol position tracking used by exit rules. See
/// [`crate::position`] for the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionState {
    pub portfolio_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_date: Option<NaiveDate>,
    pub entry_price: Option<f64>,
    pub peak_price: Option<f64>,
    pub trough_price: Option<f64>,
    pub pending_direction: Option<Direction>,
    pub signal_flip_date: Option<NaiveDate>,
    pub consecutive_flip_days: u32,
    pub entry_atr: Option<f64>,
    /// Bars date of the last exit evaluation; redelivered batches for the
    /// same date do not advance the persistence counter.
    #[serde(default)]
    pub last_evaluated: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitchSource {
    Auto,
    Manual,
}

impl KillSwitchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            KillSwitchSource::Auto => "auto",
            KillSwitchSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillSwitchState {
    pub portfolio_id: String,
    pub active: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub source: Option<KillSwitchSource>,
}

impl KillSwitchState {
    pub fn inactive(portfolio_id: &str) -> Self {
        Self {
            portfolio_id: portfolio_id.to_string(),
            active: false,
            triggered_at: None,
            reason: None,
            source: None,
        }
    }
}

/// Classification used by diversification caps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instrument {
    pub symbol: String,
    pub sector: Option<String>,
    pub asset_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fundamentals {
    pub symbol: String,
    pub market_cap: Option<f64>,
    pub beta: Option<f64>,
    pub avg_dollar_volume: Option<f64>,
}

/// Market-wide context for a date: sentiment in [-1, 1], breadth as the
/// fraction of the universe above its trend, and a volatility index level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    pub date: NaiveDate,
    pub sentiment: Option<f64>,
    pub breadth: Option<f64>,
    pub volatility_index: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_serializes_as_integer() {
        let json = serde_json::to_string(&Direction::Short).unwrap();
        assert_eq!(json, "-1");
        let parsed: Direction = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, Direction::Long);
        assert!(serde_json::from_str::<Direction>("2").is_err());
    }

    #[test]
    fn test_order_status_round_trips_through_db_text() {
        for status in [
            OrderStatus::New,
            OrderStatus::PendingExecution,
            OrderStatus::Accepted,
            OrderStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::Accepted.is_terminal());
    }

    #[test]
    fn test_target_change_detection() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let base = TargetExposure {
            portfolio_id: "main".into(),
            date,
            symbol: "SPY".into(),
            target_exposure: 0.1,
            scaling_factor: 1.0,
            is_capped: false,
            reason: "signal".into(),
            is_exit: false,
        };
        let mut same = base.clone();
        same.target_exposure += 1e-12;
        assert!(!same.differs_from(&base));

        let mut capped = base.clone();
        capped.is_capped = true;
        assert!(capped.differs_from(&base));
    }

    #[test]
    fn test_fill_id_derivation_is_stable() {
        assert_eq!(Fill::id_for_broker_order("abc-123"), "fill-abc-123");
    }
}
