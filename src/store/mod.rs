//! Relational store for pipeline entities.
//!
//! Every write that can race with a redelivered event is keyed by a
//! natural uniqueness constraint so replays are no-ops.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{
    Fill, Holding, Order, OrderStatus, PortfolioState, PositionState, Signal, TargetExposure,
};
use crate::Result;

/// Everything the ledger writes for one fill, committed atomically
/// together with the processed-fill marker.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    pub fill_id: String,
    pub portfolio_id: String,
    /// Holdings to upsert (the traded symbol plus revalued positions).
    pub holdings: Vec<Holding>,
    /// Symbol whose holding netted to zero and must be removed.
    pub closed_symbol: Option<String>,
    pub position: PositionState,
    pub state: PortfolioState,
    /// Latest portfolio state the update was computed from (None before
    /// the first fill). The commit fails with a retryable conflict if
    /// another fill was applied since.
    pub based_on: Option<PortfolioState>,
}

#[async_trait]
pub trait TradingStore: Send + Sync {
    // Signals
    async fn upsert_signal(&self, signal: &Signal) -> Result<()>;
    async fn latest_signal_date(&self, strategy: &str, on_or_before: NaiveDate)
        -> Result<Option<NaiveDate>>;
    async fn signals_for_date(&self, strategy: &str, date: NaiveDate) -> Result<Vec<Signal>>;
    async fn latest_signal(
        &self,
        strategy: &str,
        symbol: &str,
        on_or_before: NaiveDate,
    ) -> Result<Option<Signal>>;

    // Targets
    async fn target(&self, portfolio_id: &str, date: NaiveDate, symbol: &str)
        -> Result<Option<TargetExposure>>;
    /// Insert or update the target only if it differs from the stored row
    /// and the stored row is not an exit being overwritten by a non-exit.
    /// Returns whether a row changed.
    async fn upsert_target_if_changed(&self, target: &TargetExposure) -> Result<bool>;

    // Holdings and portfolio state
    async fn holdings(&self, portfolio_id: &str) -> Result<Vec<Holding>>;
    async fn holding(&self, portfolio_id: &str, symbol: &str) -> Result<Option<Holding>>;
    async fn latest_portfolio_state(&self, portfolio_id: &str) -> Result<Option<PortfolioState>>;
    /// Most recent state dated strictly before `date`.
    async fn portfolio_state_before(
        &self,
        portfolio_id: &str,
        date: NaiveDate,
    ) -> Result<Option<PortfolioState>>;

    // Position state
    async fn position_states(&self, portfolio_id: &str) -> Result<Vec<PositionState>>;
    async fn position_state(&self, portfolio_id: &str, symbol: &str)
        -> Result<Option<PositionState>>;
    async fn save_position_state(&self, state: &PositionState) -> Result<()>;

    // Orders
    /// Returns false when an order for (portfolio, symbol, date) already exists.
    async fn insert_order(&self, order: &Order) -> Result<bool>;
    async fn order(&self, order_id: &str) -> Result<Option<Order>>;
    /// Move to `to` only if the current status is one of `from`.
    async fn transition_order(
        &self,
        order_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<&str>,
    ) -> Result<bool>;
    async fn record_broker_order(&self, order_id: &str, broker_order_id: &str) -> Result<()>;
    async fn update_order_qty(&self, order_id: &str, qty: f64) -> Result<()>;
    async fn orders_with_status(
        &self,
        portfolio_id: &str,
        statuses: &[OrderStatus],
    ) -> Result<Vec<Order>>;
    /// Cancel every pending-like order, returning the ones canceled.
    async fn cancel_open_orders(&self, portfolio_id: &str, reason: &str) -> Result<Vec<Order>>;

    // Fills and ledger
    /// Returns false when the fill id already exists.
    async fn insert_fill(&self, fill: &Fill) -> Result<bool>;
    async fn fill(&self, fill_id: &str) -> Result<Option<Fill>>;
    async fn is_fill_processed(&self, fill_id: &str) -> Result<bool>;
    /// Apply a ledger update. Returns false (and writes nothing) if the
    /// fill was already processed. Commits for one portfolio are
    /// serialized and checked against `commit.based_on`.
    async fn commit_ledger(&self, commit: &LedgerCommit) -> Result<bool>;

    // Parameters
    async fn load_param_overrides(&self) -> Result<Vec<(String, String)>>;
    async fn set_param_override(&self, key: &str, value: &str) -> Result<()>;
}

/// Truncate toward zero at six decimals, the precision targets are stored with.
pub fn truncate_exposure(value: f64) -> f64 {
    (value * 1e6).trunc() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_exposure_toward_zero() {
        assert_eq!(truncate_exposure(0.1234567), 0.123456);
        assert_eq!(truncate_exposure(-0.1234567), -0.123456);
        assert_eq!(truncate_exposure(0.0), 0.0);
    }
}
