//! Stream names and event payloads.
//!
//! Every stream entry carries two fields: `event_type` and `payload`, the
//! latter being the JSON encoding of the event body. The enums below are
//! tagged by `event_type` so a payload decodes into the right variant.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PipelineError;
use crate::models::{
    Direction, Fill, OrderSide, OrderType, PortfolioState, Signal, TargetExposure,
};
use crate::Result;

pub const BARS_STREAM: &str = "bars";
pub const SIGNALS_STREAM: &str = "signals";
pub const TARGETS_STREAM: &str = "targets";
pub const ORDERS_STREAM: &str = "orders";
pub const FILLS_STREAM: &str = "fills";
pub const PORTFOLIO_STREAM: &str = "portfolio-state";
pub const ALERTS_STREAM: &str = "alerts";
pub const METRICS_STREAM: &str = "metrics";
pub const NOTIFICATIONS_CHANNEL: &str = "notifications";

pub fn dlq_stream(stream: &str) -> String {
    format!("{}-dlq", stream)
}

/// Raw entry as read from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub stream: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn event_type(&self) -> Option<&str> {
        self.fields.get("event_type").map(String::as_str)
    }

    pub fn payload(&self) -> Option<&str> {
        self.fields.get("payload").map(String::as_str)
    }

    /// Decode the payload into a tagged event enum. The `event_type` field
    /// is merged into the payload object before decoding.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E> {
        let event_type = self
            .event_type()
            .ok_or_else(|| PipelineError::Payload(format!("entry {} has no event_type", self.id)))?;
        let payload = self
            .payload()
            .ok_or_else(|| PipelineError::Payload(format!("entry {} has no payload", self.id)))?;

        let mut value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| PipelineError::Payload(format!("entry {}: {}", self.id, e)))?;
        match value.as_object_mut() {
            Some(object) => {
                object.insert("event_type".to_string(), event_type.into());
            }
            None => {
                return Err(PipelineError::Payload(format!(
                    "entry {} payload is not an object",
                    self.id
                )))
            }
        }

        serde_json::from_value(value)
            .map_err(|e| PipelineError::Payload(format!("entry {} ({}): {}", self.id, event_type, e)))
    }
}

/// Split an event into `(event_type, payload)` stream fields.
pub fn encode<E: Serialize>(event: &E) -> Result<Vec<(String, String)>> {
    let mut value = serde_json::to_value(event)?;
    let event_type = value
        .as_object_mut()
        .and_then(|object| object.remove("event_type"))
        .and_then(|t| t.as_str().map(str::to_string))
        .ok_or_else(|| PipelineError::Payload("event has no event_type tag".to_string()))?;

    Ok(vec![
        ("event_type".to_string(), event_type),
        ("payload".to_string(), serde_json::to_string(&value)?),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BarsEvent {
    BatchComplete {
        date: NaiveDate,
        /// Comma-separated symbol list.
        symbols: String,
        count: usize,
    },
}

impl BarsEvent {
    pub fn batch_complete(date: NaiveDate, symbols: &[String]) -> Self {
        BarsEvent::BatchComplete {
            date,
            symbols: symbols.join(","),
            count: symbols.len(),
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        match self {
            BarsEvent::BatchComplete { symbols, .. } => symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            BarsEvent::BatchComplete { date, .. } => *date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SignalEvent {
    SignalGenerated {
        strategy: String,
        symbol: String,
        date: NaiveDate,
        direction: Direction,
        target_weight: f64,
        metric_lookback_return: f64,
        metric_ewma_vol: f64,
    },
    SignalsBatchComplete {
        date: NaiveDate,
        symbols_processed: usize,
        symbols_failed: usize,
    },
}

impl From<&Signal> for SignalEvent {
    fn from(signal: &Signal) -> Self {
        SignalEvent::SignalGenerated {
            strategy: signal.strategy_version.clone(),
            symbol: signal.symbol.clone(),
            date: signal.date,
            direction: signal.direction,
            target_weight: signal.raw_target_weight,
            metric_lookback_return: signal.lookback_return,
            metric_ewma_vol: signal.annualized_vol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPayload {
    pub portfolio_id: String,
    pub date: NaiveDate,
    pub symbol: String,
    pub target_exposure: f64,
    pub reason: String,
    #[serde(default)]
    pub is_exit: bool,
}

impl From<&TargetExposure> for TargetPayload {
    fn from(target: &TargetExposure) -> Self {
        Self {
            portfolio_id: target.portfolio_id.clone(),
            date: target.date,
            symbol: target.symbol.clone(),
            target_exposure: target.target_exposure,
            reason: target.reason.clone(),
            is_exit: target.is_exit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TargetEvent {
    TargetUpdated(TargetPayload),
    ExitTriggered(TargetPayload),
}

impl TargetEvent {
    pub fn payload(&self) -> &TargetPayload {
        match self {
            TargetEvent::TargetUpdated(p) | TargetEvent::ExitTriggered(p) => p,
        }
    }

    pub fn for_target(target: &TargetExposure) -> Self {
        if target.is_exit {
            TargetEvent::ExitTriggered(target.into())
        } else {
            TargetEvent::TargetUpdated(target.into())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    #[serde(rename = "type")]
    pub order_type: OrderType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum OrderEvent {
    OrderCreated(OrderPayload),
    OrderRetry(OrderPayload),
}

impl OrderEvent {
    pub fn payload(&self) -> &OrderPayload {
        match self {
            OrderEvent::OrderCreated(p) | OrderEvent::OrderRetry(p) => p,
        }
    }
}

impl From<&crate::models::Order> for OrderPayload {
    fn from(order: &crate::models::Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            order_type: order.order_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum FillEvent {
    FillCreated {
        fill_id: String,
        order_id: String,
        symbol: String,
        side: OrderSide,
        qty: f64,
        price: f64,
    },
}

impl From<&Fill> for FillEvent {
    fn from(fill: &Fill) -> Self {
        FillEvent::FillCreated {
            fill_id: fill.fill_id.clone(),
            order_id: fill.order_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            qty: fill.qty,
            price: fill.price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PortfolioEvent {
    StateUpdate {
        portfolio_id: String,
        date: NaiveDate,
        nav: f64,
        cash: f64,
        drawdown: f64,
        gross_exposure: f64,
        net_exposure: f64,
        unrealized_pnl: f64,
        high_water_mark: f64,
    },
}

impl From<&PortfolioState> for PortfolioEvent {
    fn from(state: &PortfolioState) -> Self {
        PortfolioEvent::StateUpdate {
            portfolio_id: state.portfolio_id.clone(),
            date: state.date,
            nav: state.nav,
            cash: state.cash,
            drawdown: state.drawdown,
            gross_exposure: state.gross_exposure,
            net_exposure: state.net_exposure,
            unrealized_pnl: state.unrealized_pnl,
            high_water_mark: state.high_water_mark,
        }
    }
}

/// Dead-letter entry written after retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

impl DeadLetter {
    pub fn from_entry(entry: &StreamEntry, error: &str) -> Result<Self> {
        Ok(Self {
            original_id: entry.id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
            payload: serde_json::to_string(&entry.fields)?,
        })
    }

    pub fn fields(&self) -> Vec<(String, String)> {
        vec![
            ("original_id".to_string(), self.original_id.clone()),
            ("error".to_string(), self.error.clone()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
            ("payload".to_string(), self.payload.clone()),
        ]
    }
}
