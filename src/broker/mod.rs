//! Broker client port.

pub mod alpaca;
pub mod paper;

pub use alpaca::AlpacaClient;
pub use paper::PaperBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::OrderSide;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    /// Market-on-open: executes in the opening auction.
    Opg,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrderRequest {
    /// Our order id, so a resubmission can be matched to the first one.
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub time_in_force: TimeInForce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Other(String),
}

impl BrokerOrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "new" | "pending_new" => BrokerOrderStatus::New,
            "accepted" | "accepted_for_bidding" => BrokerOrderStatus::Accepted,
            "partially_filled" => BrokerOrderStatus::PartiallyFilled,
            "filled" => BrokerOrderStatus::Filled,
            "canceled" | "pending_cancel" => BrokerOrderStatus::Canceled,
            "rejected" => BrokerOrderStatus::Rejected,
            "expired" => BrokerOrderStatus::Expired,
            other => BrokerOrderStatus::Other(other.to_string()),
        }
    }

    /// The broker will not fill this order any further.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            BrokerOrderStatus::Canceled | BrokerOrderStatus::Rejected | BrokerOrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub status: BrokerOrderStatus,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl BrokerOrder {
    pub fn is_filled(&self) -> bool {
        self.status == BrokerOrderStatus::Filled && self.filled_avg_price.is_some()
    }
}

/// Signed position quantity held at the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketClock {
    pub is_open: bool,
    pub timestamp: DateTime<Utc>,
    pub next_open: Option<DateTime<Utc>>,
    pub next_close: Option<DateTime<Utc>>,
}

/// Brokerage operations the executor needs.
///
/// Transport failures, 429 and 5xx responses surface as transient
/// [`crate::PipelineError::Broker`] errors; other 4xx responses are terminal.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrder>;

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder>;

    async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<BrokerOrder>>;

    async fn get_open_position(&self, symbol: &str) -> Result<Option<BrokerPosition>>;

    async fn get_clock(&self) -> Result<MarketClock>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<()>;

    async fn latest_trade_price(&self, symbol: &str) -> Result<Option<f64>>;
}
