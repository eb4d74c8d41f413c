//! Pull-based market data capabilities.
//!
//! Provider adapters (vendors, files) populate the store out of band; the
//! pipeline only reads through these traits. Both stores implement them.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;

use crate::models::{Bar, Fundamentals, Instrument, MarketContext};
use crate::Result;

#[async_trait]
pub trait FetchDailyBars: Send + Sync {
    /// Up to `limit` bars ending at `end` (inclusive), oldest first.
    async fn daily_bars(&self, symbol: &str, end: NaiveDate, limit: usize) -> Result<Vec<Bar>>;

    async fn latest_close(&self, symbol: &str, on_or_before: NaiveDate) -> Result<Option<f64>>;
}

#[async_trait]
pub trait FetchFundamentals: Send + Sync {
    async fn fundamentals(&self, symbols: &[String]) -> Result<HashMap<String, Fundamentals>>;

    async fn instruments(&self, symbols: &[String]) -> Result<HashMap<String, Instrument>>;
}

#[async_trait]
pub trait FetchMarketContext: Send + Sync {
    async fn market_context(&self, date: NaiveDate) -> Result<Option<MarketContext>>;
}

/// All read capabilities the pipeline stages use.
pub trait MarketData: FetchDailyBars + FetchFundamentals + FetchMarketContext {}

impl<T> MarketData for T where T: FetchDailyBars + FetchFundamentals + FetchMarketContext {}

/// Latest close for each symbol, skipping symbols without data.
pub async fn latest_closes(
    market: &dyn MarketData,
    symbols: &[String],
    on_or_before: NaiveDate,
) -> Result<HashMap<String, f64>> {
    let mut prices = HashMap::with_capacity(symbols.len());
    for symbol in symbols {
        if let Some(price) = market.latest_close(symbol, on_or_before).await? {
            prices.insert(symbol.clone(), price);
        }
    }
    Ok(prices)
}
